use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// A resettable sleep timer for use in `tokio::select!` loops.
///
/// In its idle state the handle never resolves. Once [`set`](Self::set), it resolves after the
/// given duration and must be reset or set again before the next poll.
pub struct SleepHandle(Option<Pin<Box<tokio::time::Sleep>>>);

impl SleepHandle {
    /// Creates a sleep handle in idle state.
    pub fn idle() -> Self {
        Self(None)
    }

    /// Resets the handle into idle state.
    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Arms the handle to resolve after `duration`.
    pub fn set(&mut self, duration: Duration) {
        self.0 = Some(Box::pin(tokio::time::sleep(duration)));
    }

    /// Returns `true` if the handle is idle.
    pub fn is_idle(&self) -> bool {
        self.0.is_none()
    }
}

impl Future for SleepHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            Some(sleep) => sleep.as_mut().poll(cx),
            None => Poll::Pending,
        }
    }
}
