//! Fixed-interval retry policy for the end-of-session flush.
//!
//! Unlike connection backoff there is no cap on attempts: the end marker must
//! eventually reach the broker, so the relay keeps flushing until it does.
//! A slower shutdown is preferable to a session whose replay never ends.

use std::time::Duration;

/// Fixed-interval, unbounded retry counter.
#[derive(Debug, Clone)]
pub struct FlushRetry {
    /// Failed attempts so far
    attempt: u32,
    /// Pause between attempts
    delay: Duration,
}

impl FlushRetry {
    /// Default pause between flush attempts: 1 second
    const DEFAULT_DELAY: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::with_delay(Self::DEFAULT_DELAY)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { attempt: 0, delay }
    }

    /// Record a failed attempt and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay
    }

    /// Failed attempts recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for FlushRetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delay() {
        let retry = FlushRetry::new();
        assert_eq!(retry.delay(), Duration::from_secs(1));
        assert_eq!(retry.attempt(), 0);
    }

    #[test]
    fn test_delay_stays_fixed() {
        let mut retry = FlushRetry::with_delay(Duration::from_millis(250));
        for _ in 0..10 {
            assert_eq!(retry.next_delay(), Duration::from_millis(250));
        }
        assert_eq!(retry.attempt(), 10);
    }

    #[test]
    fn test_attempt_saturates() {
        let mut retry = FlushRetry {
            attempt: u32::MAX - 1,
            delay: Duration::ZERO,
        };
        retry.next_delay();
        retry.next_delay();
        assert_eq!(retry.attempt(), u32::MAX);
    }
}
