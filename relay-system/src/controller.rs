use std::future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::watch;

/// A message to notify all services to shut down.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// The timeout for graceful shutdown.
    ///
    /// Within this timeout, services should try to finish pending work and shut down gracefully.
    /// `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

fn shutdown_channel() -> &'static watch::Sender<Option<Shutdown>> {
    static CHANNEL: OnceLock<watch::Sender<Option<Shutdown>>> = OnceLock::new();
    CHANNEL.get_or_init(|| watch::channel(None).0)
}

/// Notifies a service about an upcoming shutdown.
///
/// Obtained through [`Controller::shutdown_handle`]. Every service that has to flush state on
/// shutdown should poll [`notified`](Self::notified) in its message loop.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state, if a shutdown was triggered.
    pub fn get(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }

    /// Waits for a shutdown to be triggered.
    ///
    /// This waits for the next shutdown notification. Use [`get`](Self::get) to check whether a
    /// shutdown has already been triggered.
    pub async fn notified(&mut self) -> Shutdown {
        while self.0.changed().await.is_ok() {
            if let Some(shutdown) = &*self.0.borrow() {
                return shutdown.clone();
            }
        }

        // All senders dropped without a shutdown. Since the channel is static, this should not
        // occur during regular operation. Wait forever instead of reporting a spurious shutdown.
        future::pending().await
    }
}

/// Installs signal handlers and coordinates graceful shutdown.
///
/// On `SIGTERM`, the controller issues a graceful [`Shutdown`] with the configured timeout. On
/// `SIGINT` (Ctrl-C), it issues an immediate shutdown without timeout.
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts listening for process signals.
    ///
    /// This must be called from within a tokio runtime.
    pub fn start(shutdown_timeout: Duration) {
        tokio::spawn(Self::signal_loop(shutdown_timeout));
    }

    /// Returns a [`ShutdownHandle`] to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        ShutdownHandle(shutdown_channel().subscribe())
    }

    /// Manually triggers a shutdown.
    ///
    /// A `timeout` of `None` shuts down immediately.
    pub fn shutdown(timeout: Option<Duration>) {
        shutdown_channel().send_replace(Some(Shutdown { timeout }));
    }

    #[cfg(unix)]
    async fn signal_loop(shutdown_timeout: Duration) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(error) => {
                relay_log::error!("failed to install SIGINT handler: {error}");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(error) => {
                relay_log::error!("failed to install SIGTERM handler: {error}");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    relay_log::info!("SIGINT received, exiting immediately");
                    Self::shutdown(None);
                }
                _ = sigterm.recv() => {
                    relay_log::info!("SIGTERM received, starting graceful shutdown");
                    Self::shutdown(Some(shutdown_timeout));
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn signal_loop(shutdown_timeout: Duration) {
        while tokio::signal::ctrl_c().await.is_ok() {
            relay_log::info!("CTRL-C received, starting graceful shutdown");
            Self::shutdown(Some(shutdown_timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_notifies_handles() {
        let mut handle = Controller::shutdown_handle();
        assert!(handle.get().is_none());

        Controller::shutdown(Some(Duration::from_secs(1)));

        let shutdown = handle.notified().await;
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(1)));

        // Handles created after the shutdown see the state through `get`.
        let late = Controller::shutdown_handle();
        assert!(late.get().is_some());
    }
}
