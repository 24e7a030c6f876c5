//! Retry logic with exponential backoff for transient apply errors.
//!
//! The decision of whether and when to retry is a pure function over
//! [`RetryState`], so it can be tested without real delays. The async
//! [`with_retry`] driver only adds the (cancellable) sleeping.

use crate::error::ApplyError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retry policy for a single resource operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub limit: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            base_delay: Duration::from_secs(5),
            factor: 2.0,
            max_delay: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            limit,
            base_delay,
            factor,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            limit: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Total attempts an always-transient failure will consume
    pub fn max_attempts(&self) -> u32 {
        self.limit.saturating_add(1)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Retry progress for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    /// Failed attempts so far
    pub attempt: u32,
    pub next_eligible_at: Option<Instant>,
}

impl RetryState {
    /// Record a failure and decide whether another attempt is allowed
    pub fn on_failure(&mut self, policy: &RetryPolicy, error: &ApplyError, now: Instant) -> RetryDecision {
        let retries_used = self.attempt;
        self.attempt += 1;
        if !error.is_retryable() || retries_used >= policy.limit {
            self.next_eligible_at = None;
            return RetryDecision::GiveUp;
        }
        let after = policy.delay_for_attempt(retries_used);
        self.next_eligible_at = Some(now + after);
        RetryDecision::Retry { after }
    }

    /// Number of retries performed (attempts after the first)
    pub fn retries(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}

/// Outcome of a retried operation that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The last error, after `attempts` tries
    Failed { error: ApplyError, attempts: u32 },
    /// Stopped while waiting to retry, or before a call was issued
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Transient errors are retried with exponential backoff; permanent errors
/// return immediately. `on_retry(attempt, error, delay)` is called before
/// each backoff sleep. The sleep ends early when `cancel` fires, and an
/// operation returning [`ApplyError::Cancelled`] ends the loop the same way
/// without counting as an attempt.
///
/// Returns the value along with the number of attempts made.
pub async fn with_retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: C,
    mut operation: F,
) -> Result<(T, u32), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplyError>>,
    C: FnMut(u32, &ApplyError, Duration),
{
    let mut state = RetryState::default();
    loop {
        match operation().await {
            Ok(value) => return Ok((value, state.attempt + 1)),
            Err(ApplyError::Cancelled) => {
                return Err(RetryError::Cancelled {
                    attempts: state.attempt,
                });
            }
            Err(error) => match state.on_failure(policy, &error, Instant::now()) {
                RetryDecision::GiveUp => {
                    return Err(RetryError::Failed {
                        error,
                        attempts: state.attempt,
                    });
                }
                RetryDecision::Retry { after } => {
                    on_retry(state.attempt, &error, after);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: state.attempt });
                        }
                        () = tokio::time::sleep(after) => {}
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> ApplyError {
        ApplyError::Unavailable {
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(5), 2.0, Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(30));
    }

    #[test]
    fn test_on_failure_bound() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), 2.0, Duration::from_secs(60));
        let mut state = RetryState::default();
        let now = Instant::now();

        assert_eq!(
            state.on_failure(&policy, &unavailable(), now),
            RetryDecision::Retry { after: Duration::from_secs(1) }
        );
        assert_eq!(state.next_eligible_at, Some(now + Duration::from_secs(1)));
        assert_eq!(
            state.on_failure(&policy, &unavailable(), now),
            RetryDecision::Retry { after: Duration::from_secs(2) }
        );
        assert_eq!(state.on_failure(&policy, &unavailable(), now), RetryDecision::GiveUp);
        assert_eq!(state.attempt, 3);
        assert_eq!(state.retries(), 2);
    }

    #[test]
    fn test_permanent_error_gives_up() {
        let mut state = RetryState::default();
        let error = ApplyError::Forbidden {
            key: "v1/Secret/ns/x".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(
            state.on_failure(&RetryPolicy::default(), &error, Instant::now()),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_exhausts_limit() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), 2.0, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let mut notified = Vec::new();

        let result: Result<((), u32), _> = with_retry(
            &policy,
            &CancellationToken::new(),
            |attempt, _, delay| notified.push((attempt, delay)),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err().attempts(), 4);
        assert_eq!(notified.len(), 3);
        assert_eq!(notified[2], (3, Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_eventual_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            |_, _, _| {},
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), (42, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_operation_reports_cancellation() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> = with_retry(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            |_, _, _| {},
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Err(ApplyError::Cancelled)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), RetryError::Cancelled { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<((), u32), _> = with_retry(
            &RetryPolicy::new(5, Duration::from_secs(60), 2.0, Duration::from_secs(600)),
            &cancel,
            |_, _, _| {},
            || async { Err(unavailable()) },
        )
        .await;

        assert_eq!(result.unwrap_err(), RetryError::Cancelled { attempts: 1 });
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
