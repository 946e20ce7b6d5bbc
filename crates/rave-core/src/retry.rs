use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Exponential backoff policy: `delay(n) = min(initial * 2^(n-1), max)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl Backoff {
    /// Delay to sleep after the given 1-based failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// - `backoff`: attempt count and delay schedule.
/// - `label`: description for log messages.
/// - `f`: closure producing the future to retry.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn retry<F, Fut, T>(backoff: Backoff, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 1..=backoff.max_attempts.max(1) {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < backoff.max_attempts {
                    let delay = backoff.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = backoff.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::error::Error;

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let b = Backoff {
            initial_delay: Duration::from_millis(1),
            ..Backoff::default()
        };
        let result = retry(b, "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let b = Backoff {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let count = Cell::new(0);
        let result = retry(b, "test", || {
            let c = count.get() + 1;
            count.set(c);
            async move {
                if c < 3 {
                    Err(Error::transient("not yet"))
                } else {
                    Ok(c)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let b = Backoff {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let count = Cell::new(0);
        let result: Result<i32> = retry(b, "test", || {
            count.set(count.get() + 1);
            async { Err(Error::transient("always fails")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_delay_schedule_caps_at_max() {
        let b = Backoff {
            max_attempts: 8,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        };
        assert_eq!(b.delay_after(1), Duration::from_secs(1));
        assert_eq!(b.delay_after(2), Duration::from_secs(2));
        assert_eq!(b.delay_after(5), Duration::from_secs(16));
        assert_eq!(b.delay_after(8), Duration::from_secs(16));
    }
}
