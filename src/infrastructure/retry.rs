//! Fixed-delay retry for external service calls

use std::time::Duration;

use super::config::RetryConfig;

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.delay,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy without delay, for tests and offline runs
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub fn run<T, E, F, P>(&self, operation: &str, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        total = attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(operation, attempt, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = RetryPolicy::immediate(3).run(
            "token",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("unavailable".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        );
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_stops_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = RetryPolicy::immediate(3).run(
            "token",
            || {
                calls.set(calls.get() + 1);
                Err(format!("failure {}", calls.get()))
            },
            |_| true,
        );
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_non_retryable_error_is_returned_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), String> = RetryPolicy::immediate(5).run(
            "token",
            || {
                calls.set(calls.get() + 1);
                Err("forbidden".to_string())
            },
            |e| e != "forbidden",
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(2));
    }
}
