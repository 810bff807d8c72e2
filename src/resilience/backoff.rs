//! # Exponential Backoff
//!
//! Bounded retry with exponential delay, jitter and a cap. The retry budget is
//! expressed in `steps`: the operation is invoked at most `steps` times.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the second attempt
    pub duration: Duration,
    /// Multiplier applied after every failed attempt
    pub factor: f64,
    /// Random extra fraction of each delay, `0.0..=jitter`
    pub jitter: f64,
    /// Maximum number of attempts
    pub steps: u32,
    /// Upper bound on any single delay
    pub cap: Duration,
}

impl Backoff {
    /// Artifact driver operations
    pub const DRIVER: Backoff = Backoff {
        duration: Duration::from_secs(2),
        factor: 2.0,
        jitter: 0.1,
        steps: 5,
        cap: Duration::from_secs(10 * 60),
    };

    /// Persistence reads: 100ms, 200ms, 400ms, 800ms
    pub const PERSISTENCE_READ: Backoff = Backoff {
        duration: Duration::from_millis(100),
        factor: 2.0,
        jitter: 0.0,
        steps: 5,
        cap: Duration::from_secs(10),
    };

    /// Persistence writes: 1s, 2s, 4s, 8s, 16s
    pub const PERSISTENCE_WRITE: Backoff = Backoff {
        duration: Duration::from_secs(1),
        factor: 2.0,
        jitter: 0.0,
        steps: 5,
        cap: Duration::from_secs(31),
    };

    /// Short conflict retries for object updates
    pub const DEFAULT: Backoff = Backoff {
        duration: Duration::from_millis(10),
        factor: 1.0,
        jitter: 0.1,
        steps: 5,
        cap: Duration::from_secs(1),
    };

    /// Same attempt budget with no sleeping between attempts
    pub fn without_delay(self) -> Self {
        Self {
            duration: Duration::ZERO,
            cap: Duration::ZERO,
            jitter: 0.0,
            ..self
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.duration.as_secs_f64() * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            secs *= 1.0 + self.jitter * fastrand::f64();
        }
        let capped = secs.min(self.cap.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Sum of the delays between all attempts, without jitter
    pub fn total_delay(&self) -> Duration {
        let unjittered = Self { jitter: 0.0, ..*self };
        (0..self.steps.saturating_sub(1))
            .map(|attempt| unjittered.delay_for(attempt))
            .sum()
    }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or the
/// attempt budget is spent. The last error is returned.
pub async fn retry_on<T, E, F, Fut, P>(
    backoff: &Backoff,
    is_retriable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let steps = backoff.steps.max(1);
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= steps || !is_retriable(&err) {
                    return Err(err);
                }
                let delay = backoff.delay_for(attempt - 1);
                debug!(
                    attempt = attempt,
                    max_attempts = steps,
                    delay_ms = delay.as_millis() as u64,
                    "🔁 Retrying after transient failure"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_persistence_write_total_delay() {
        assert_eq!(
            Backoff::PERSISTENCE_WRITE.total_delay(),
            Duration::from_secs(15)
        );
        assert!(Backoff::PERSISTENCE_READ.total_delay() <= Duration::from_secs(10));
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff {
            duration: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
            steps: 30,
            cap: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(20), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retry_stops_after_steps() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_on(
            &Backoff::DRIVER.without_delay(),
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("connection reset") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_on(
            &Backoff::DRIVER.without_delay(),
            |_| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("NoSuchKey") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_on(
            &Backoff::DRIVER.without_delay(),
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("timeout")
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
    }
}
