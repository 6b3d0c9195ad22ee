//! Retry protocol applied to every remote worker call.
//!
//! [`RetryInvoker`] runs one operation up to `max_attempts` times and decides
//! what to do after each failure from the error's [`RetryClass`]:
//! - `Unreachable`: log, run the caller's reopen hook if enabled, try again
//! - `Transient`: log, try again
//! - `Fatal`: stop and return the error as is
//!
//! When the budget runs out the invoker either raises
//! [`ArbiterError::MaxAttemptsExceeded`] or yields `Ok(None)` so the caller can
//! substitute an empty result.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ArbiterError, Result, RetryClass};

/// Exponential delay between attempts: `base * 2^attempt`, capped at `max`,
/// with +/- `jitter` proportional noise.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let spread = delay * self.jitter.clamp(0.0, 1.0);
        let noise = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_millis((delay + noise).max(0.0) as u64)
    }
}

/// Retry behaviour shared by every worker handle.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Relaunch the worker when its endpoint cannot be reached.
    pub reopen_on_unreachable: bool,

    /// Raise `MaxAttemptsExceeded` when the budget is spent; otherwise the call
    /// resolves to an empty result.
    pub fail_on_max_attempts: bool,

    /// Delay between attempts. `None` retries immediately.
    pub backoff: Option<BackoffPolicy>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reopen_on_unreachable: true,
            fail_on_max_attempts: true,
            backoff: None,
        }
    }
}

/// Runs a fallible async operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryInvoker {
    max_attempts: u32,
    policy: RetryPolicy,
}

impl RetryInvoker {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, policy: RetryPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Invoke `op` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// `op` receives the one-based attempt number. `reopen` is awaited after an
    /// unreachable-endpoint failure when the policy asks for it; errors from it
    /// are the hook's own business.
    pub async fn run<T, Op, Fut, Reopen, ReopenFut>(
        &self,
        method: &'static str,
        worker: &str,
        mut op: Op,
        mut reopen: Reopen,
    ) -> Result<Option<T>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        Reopen: FnMut() -> ReopenFut,
        ReopenFut: Future<Output = ()>,
    {
        for attempt in 1..=self.max_attempts {
            let err = match op(attempt).await {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            };

            match err.retry_class() {
                RetryClass::Fatal => return Err(err),
                RetryClass::Unreachable => {
                    warn!(
                        worker = %worker,
                        method,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Worker endpoint unreachable"
                    );
                    if self.policy.reopen_on_unreachable {
                        reopen().await;
                    }
                }
                RetryClass::Transient => {
                    warn!(
                        worker = %worker,
                        method,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Worker call failed, retrying"
                    );
                }
            }

            if attempt < self.max_attempts {
                if let Some(backoff) = &self.policy.backoff {
                    let delay = backoff.delay(attempt - 1);
                    debug!(worker = %worker, method, delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if self.policy.fail_on_max_attempts {
            Err(ArbiterError::MaxAttemptsExceeded {
                method,
                worker: worker.to_string(),
                attempts: self.max_attempts,
            })
        } else {
            warn!(
                worker = %worker,
                method,
                attempts = self.max_attempts,
                "Max attempts reached, returning empty result"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn invoker(max_attempts: u32, fail_on_max_attempts: bool) -> RetryInvoker {
        RetryInvoker::new(
            max_attempts,
            RetryPolicy {
                reopen_on_unreachable: true,
                fail_on_max_attempts,
                backoff: None,
            },
        )
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = AtomicU32::new(0);
        let result = invoker(5, true)
            .run(
                "hello_world",
                "w",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ArbiterError>("hi")
                },
                || async {},
            )
            .await
            .unwrap();

        assert_eq!(result, Some("hi"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fault_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>> = invoker(5, true)
            .run(
                "execute",
                "w",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ArbiterError::Fault {
                        method: "execute",
                        message: "bad script".into(),
                    })
                },
                || async {},
            )
            .await;

        assert!(matches!(result, Err(ArbiterError::Fault { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_retries_and_reopens() {
        let calls = AtomicU32::new(0);
        let reopens = AtomicU32::new(0);
        let result = invoker(3, true)
            .run(
                "get_status",
                "w",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(ArbiterError::EndpointUnreachable("refused".into()))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                || async {
                    reopens.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        assert_eq!(result, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reopens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reopen_disabled() {
        let reopens = AtomicU32::new(0);
        let invoker = RetryInvoker::new(
            2,
            RetryPolicy {
                reopen_on_unreachable: false,
                ..RetryPolicy::default()
            },
        );
        let _ = invoker
            .run(
                "get_status",
                "w",
                |_| async { Err::<(), _>(ArbiterError::EndpointUnreachable("refused".into())) },
                || async {
                    reopens.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(reopens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal_when_configured() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>> = invoker(4, true)
            .run(
                "close_job",
                "w",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ArbiterError::Transient("reset".into()))
                },
                || async {},
            )
            .await;

        assert!(matches!(
            result,
            Err(ArbiterError::MaxAttemptsExceeded { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_none_when_lenient() {
        let result: Option<()> = invoker(2, false)
            .run(
                "close_job",
                "w",
                |_| async { Err(ArbiterError::Transient("reset".into())) },
                || async {},
            )
            .await
            .unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let calls = AtomicU32::new(0);
        let invoker = invoker(0, true);
        assert_eq!(invoker.max_attempts(), 1);
        let _ = invoker
            .run(
                "hello_world",
                "w",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ArbiterError::Transient("x".into()))
                },
                || async {},
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let invoker = RetryInvoker::new(
            3,
            RetryPolicy {
                backoff: Some(BackoffPolicy {
                    base: Duration::from_millis(100),
                    max: Duration::from_secs(1),
                    jitter: 0.0,
                }),
                ..RetryPolicy::default()
            },
        );

        let start = tokio::time::Instant::now();
        let _ = invoker
            .run(
                "hello_world",
                "w",
                |_| async { Err::<(), _>(ArbiterError::Transient("x".into())) },
                || async {},
            )
            .await;

        // 100ms after the first failure, 200ms after the second, none after the last.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_delay_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
