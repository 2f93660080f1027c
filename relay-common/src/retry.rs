use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

/// Initial backoff interval in milliseconds.
const INITIAL_INTERVAL: u64 = 1000;

/// Default multiplier for the exponential backoff.
const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Default randomization factor for the backoff interval.
const DEFAULT_RANDOMIZATION: f64 = 0.1;

/// Exponential backoff for repeated attempts with bounded intervals.
///
/// The first attempt is immediate. Subsequent intervals grow exponentially up
/// to the configured maximum, with a small randomization factor applied.
#[derive(Debug)]
pub struct RetryBackoff {
    backoff: ExponentialBackoff,
    attempt: usize,
}

impl RetryBackoff {
    /// Creates a new retry backoff with the given maximum interval.
    pub fn new(max_interval: Duration) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(INITIAL_INTERVAL),
            initial_interval: Duration::from_millis(INITIAL_INTERVAL),
            randomization_factor: DEFAULT_RANDOMIZATION,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };

        RetryBackoff {
            backoff,
            attempt: 0,
        }
    }

    /// Returns whether a backoff attempt has started.
    pub fn started(&self) -> bool {
        self.attempt > 0
    }

    /// Returns the number of the current attempt, starting at `0`.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the delay until the next attempt.
    pub fn next_backoff(&mut self) -> Duration {
        let duration = match self.attempt {
            0 => Duration::new(0, 0),
            _ => self
                .backoff
                .next_backoff()
                .unwrap_or(self.backoff.max_interval),
        };

        self.attempt += 1;
        duration
    }

    /// Resets this backoff to its initial state.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_is_immediate() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(10));
        assert!(!backoff.started());
        assert_eq!(backoff.next_backoff(), Duration::new(0, 0));
        assert!(backoff.started());
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let max = Duration::from_secs(2);
        let mut backoff = RetryBackoff::new(max);

        let mut previous = backoff.next_backoff();
        assert_eq!(previous, Duration::new(0, 0));

        for _ in 0..20 {
            let next = backoff.next_backoff();
            // Randomization adds at most 10% on top of the maximum interval.
            assert!(next <= max.mul_f64(1.0 + DEFAULT_RANDOMIZATION));
            previous = next;
        }

        assert!(previous >= max.mul_f64(1.0 - DEFAULT_RANDOMIZATION));
        assert_eq!(backoff.attempt(), 21);
    }

    #[test]
    fn test_reset() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(10));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert!(!backoff.started());
        assert_eq!(backoff.next_backoff(), Duration::new(0, 0));
    }
}
