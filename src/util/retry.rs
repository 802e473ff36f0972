use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use tracing::warn;

use crate::{config::RetryConfig, Error};

/// Retries retryable errors after a constant delay, up to `max_attempts`.
pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ErrorHandler<Error> for FixedCountWithDelayStrategy {
    type OutError = Error;

    fn handle(&mut self, attempt: usize, e: Error) -> RetryPolicy<Error> {
        if attempt >= self.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }
        RetryPolicy::WaitRetry(self.delay)
    }
}

/// Retries retryable errors with exponential backoff, up to the configured
/// number of attempts.
pub(crate) struct ExponentialBackoffStrategy<'a> {
    config: &'a RetryConfig,
    partition_id: &'a str,
}

impl<'a> ExponentialBackoffStrategy<'a> {
    pub(crate) fn new(config: &'a RetryConfig, partition_id: &'a str) -> Self {
        Self {
            config,
            partition_id,
        }
    }
}

impl ErrorHandler<Error> for ExponentialBackoffStrategy<'_> {
    type OutError = Error;

    fn handle(&mut self, attempt: usize, e: Error) -> RetryPolicy<Error> {
        if attempt >= self.config.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        let delay = self.config.calculate_delay(attempt);
        warn!(
            partition = %self.partition_id,
            attempt,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Read failed, retrying with backoff"
        );
        RetryPolicy::WaitRetry(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> Error {
        Error::TransientRead {
            partition_id: "0".into(),
            message: "busy".into(),
        }
    }

    #[test]
    fn test_backoff_retries_transient_until_exhausted() {
        let config = RetryConfig::new(Duration::from_millis(10), Duration::from_secs(1), 3)
            .without_jitter();
        let mut strategy = ExponentialBackoffStrategy::new(&config, "0");

        assert!(matches!(
            strategy.handle(1, transient()),
            RetryPolicy::WaitRetry(d) if d == Duration::from_millis(10)
        ));
        assert!(matches!(
            strategy.handle(2, transient()),
            RetryPolicy::WaitRetry(d) if d == Duration::from_millis(20)
        ));
        assert!(matches!(
            strategy.handle(3, transient()),
            RetryPolicy::ForwardError(Error::TransientRead { .. })
        ));
    }

    #[test]
    fn test_backoff_forwards_permanent_errors() {
        let config = RetryConfig::default();
        let mut strategy = ExponentialBackoffStrategy::new(&config, "0");
        let permanent = Error::Read {
            partition_id: "0".into(),
            message: "gone".into(),
        };
        assert!(matches!(
            strategy.handle(1, permanent),
            RetryPolicy::ForwardError(Error::Read { .. })
        ));
    }

    #[test]
    fn test_fixed_count() {
        let mut strategy = FixedCountWithDelayStrategy::new(2, Duration::from_millis(5));
        assert!(matches!(
            strategy.handle(1, Error::Store("timeout".into())),
            RetryPolicy::WaitRetry(_)
        ));
        assert!(matches!(
            strategy.handle(2, Error::Store("timeout".into())),
            RetryPolicy::ForwardError(_)
        ));
    }
}
