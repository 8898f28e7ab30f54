//! Retrying engine calls with exponential backoff.
//!
//! Operations report each attempt as a [`keen_retry::RetryResult`], which lets
//! them say "this might work next time" ([`RetryResult::Transient`]) or "give
//! up now" ([`RetryResult::Fatal`]). [`with_retry`] then owns the schedule:
//! how many attempts, how long to wait, and when the whole thing has taken
//! too long.

use std::{fmt, time::Duration};

use keen_retry::RetryResult;
use schemars::JsonSchema;
use tokio::time::{self, Instant};

use crate::{
    engines::{EngineError, EngineErrorKind},
    prelude::*,
};

/// Is this error worth another attempt?
///
/// Only timeouts and rate limits count. Auth failures, malformed responses and
/// anything we can't classify fail immediately.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for EngineErrorKind {
    fn is_known_transient(&self) -> bool {
        matches!(self, EngineErrorKind::Timeout | EngineErrorKind::RateLimit)
    }
}

impl IsKnownTransient for EngineError {
    fn is_known_transient(&self) -> bool {
        self.kind.is_known_transient()
    }
}

/// Convert a [`Result`] into a [`RetryResult`], using [`IsKnownTransient`] to
/// decide whether an error is worth retrying.
pub trait IntoRetryResult<T, E> {
    /// Classify this result.
    fn into_retry_result(self) -> RetryResult<(), (), T, E>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: IsKnownTransient + fmt::Debug,
{
    fn into_retry_result(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if error.is_known_transient() => {
                debug!("Potentially transient error: {:?}", error);
                RetryResult::Transient { input: (), error }
            }
            Err(error) => RetryResult::Fatal { input: (), error },
        }
    }
}

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// How we retry a single engine call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt. Doubles after each failure.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Hard limit on the whole sequence, including delays.
    pub total_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            total_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// How long should we wait after `failed_attempt` (1-based) fails?
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Passed to each attempt.
#[derive(Clone, Copy, Debug)]
pub struct AttemptContext {
    /// Which attempt is this? Starts at 1.
    pub attempt: u32,

    /// How much of the total budget is left. Operations should pass this
    /// down as their own timeout.
    pub remaining: Duration,
}

/// What happened during one attempt.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Which attempt was this? Starts at 1.
    pub attempt: u32,

    /// How long the attempt took, in milliseconds.
    pub duration_ms: u64,

    /// How long we waited before starting this attempt, in milliseconds.
    pub delay_before_ms: u64,

    /// The kind of error, if the attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineErrorKind>,
}

/// The result of [`with_retry`], including every attempt we made.
#[derive(Debug)]
pub struct RetryReport<T> {
    /// The final result.
    pub result: Result<T, EngineError>,

    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
}

impl<T> RetryReport<T> {
    /// How many attempts did we make?
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }
}

/// Run `operation` until it succeeds, fails fatally, runs out of attempts, or
/// runs out of time.
///
/// If the total budget expires while an attempt is in flight, the attempt's
/// future is dropped, which cancels any HTTP request or child process it owns.
/// If the next backoff delay would end after the deadline, we give up
/// immediately instead of sleeping.
#[instrument(level = "debug", skip_all, fields(max_attempts = policy.max_attempts))]
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryReport<T>
where
    F: FnMut(AttemptContext) -> Fut,
    Fut: Future<Output = RetryResult<(), (), T, EngineError>>,
{
    // A budget too large to represent as an `Instant` means no deadline.
    let deadline = Instant::now().checked_add(policy.total_timeout);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = Vec::new();
    let mut delay_before = Duration::ZERO;

    for attempt in 1..=max_attempts {
        let attempt_start = Instant::now();
        let remaining = remaining_budget(deadline);
        if remaining.is_zero() {
            return RetryReport {
                result: Err(budget_exhausted(policy)),
                attempts,
            };
        }

        let ctx = AttemptContext { attempt, remaining };
        let outcome = time::timeout(remaining, operation(ctx)).await;
        let duration = attempt_start.elapsed();
        let mut record = AttemptRecord {
            attempt,
            duration_ms: millis(duration),
            delay_before_ms: millis(delay_before),
            error: None,
        };

        let error = match outcome {
            Ok(RetryResult::Ok { output, .. }) => {
                if attempt > 1 {
                    warn!(attempt, "succeeded after retrying");
                }
                attempts.push(record);
                return RetryReport {
                    result: Ok(output),
                    attempts,
                };
            }
            Ok(RetryResult::Fatal { error, .. }) => {
                error!(attempt, %error, "fatal engine error, not retrying");
                record.error = Some(error.kind);
                attempts.push(record);
                return RetryReport {
                    result: Err(error),
                    attempts,
                };
            }
            Ok(RetryResult::Transient { error, .. }) => error,
            Err(_elapsed) => {
                // The in-flight call has been dropped, so there's nothing
                // left to wait for.
                record.error = Some(EngineErrorKind::Timeout);
                attempts.push(record);
                error!(attempt, "retry budget ran out during an attempt");
                return RetryReport {
                    result: Err(budget_exhausted(policy)),
                    attempts,
                };
            }
        };

        record.error = Some(error.kind);
        attempts.push(record);

        if attempt == max_attempts {
            error!(
                attempts = attempt,
                %error,
                "FAILED after exhausting all retry attempts"
            );
            return RetryReport {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.delay_after(attempt);
        if delay >= remaining_budget(deadline) {
            error!(
                attempt,
                delay_ms = millis(delay),
                "next retry would pass the deadline, giving up"
            );
            return RetryReport {
                result: Err(budget_exhausted(policy)),
                attempts,
            };
        }
        warn!(attempt, delay_ms = millis(delay), %error, "transient error, backing off");
        time::sleep(delay).await;
        delay_before = delay;
    }

    // The last iteration always returns. This covers a loop that somehow
    // ran out without deciding.
    RetryReport {
        result: Err(budget_exhausted(policy)),
        attempts,
    }
}

/// How long until `deadline`. Without a deadline, forever.
fn remaining_budget(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |deadline| {
        deadline.saturating_duration_since(Instant::now())
    })
}

/// The error we return when the total budget runs out.
fn budget_exhausted(policy: &RetryPolicy) -> EngineError {
    EngineError::new(
        EngineErrorKind::Timeout,
        format!(
            "gave up after the total retry budget of {:?} ran out",
            policy.total_timeout
        ),
    )
}

/// Convert a [`Duration`] to whole milliseconds.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            total_timeout: Duration::from_secs(10),
        }
    }

    fn transient(kind: EngineErrorKind) -> RetryResult<(), (), (), EngineError> {
        RetryResult::Transient {
            input: (),
            error: EngineError::new(kind, "try again"),
        }
    }

    #[test]
    fn delays_double_up_to_the_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            total_timeout: Duration::from_secs(60),
        };
        let delays = (1..=5).map(|n| policy.delay_after(n)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn only_timeouts_and_rate_limits_are_transient() {
        assert!(EngineErrorKind::Timeout.is_known_transient());
        assert!(EngineErrorKind::RateLimit.is_known_transient());
        assert!(!EngineErrorKind::Auth.is_known_transient());
        assert!(!EngineErrorKind::MalformedResponse.is_known_transient());
        assert!(!EngineErrorKind::Unknown.is_known_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_use_every_attempt_with_growing_delays() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let report = with_retry(&policy(), |_ctx| {
            let starts = starts.clone();
            async move {
                starts.lock().unwrap().push(Instant::now());
                transient(EngineErrorKind::Timeout)
            }
        })
        .await;

        assert_eq!(report.attempt_count(), 3);
        assert_eq!(report.result.unwrap_err().kind, EngineErrorKind::Timeout);
        let starts = starts.lock().unwrap();
        let gaps = starts.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
        assert_eq!(gaps, vec![Duration::from_millis(100), Duration::from_millis(150)]);
        assert_eq!(report.attempts[1].delay_before_ms, 100);
        assert_eq!(report.attempts[2].delay_before_ms, 150);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let report: RetryReport<()> = with_retry(&policy(), |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                RetryResult::Fatal {
                    input: (),
                    error: EngineError::new(EngineErrorKind::Auth, "bad key"),
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.attempt_count(), 1);
        assert_eq!(report.attempts[0].error, Some(EngineErrorKind::Auth));
        assert_eq!(report.result.unwrap_err().kind, EngineErrorKind::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_a_transient_error() {
        let calls = AtomicU32::new(0);
        let report = with_retry(&policy(), |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt == 1 {
                    transient(EngineErrorKind::RateLimit)
                } else {
                    retry_result_ok(())
                }
            }
        })
        .await;

        assert!(report.result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.attempts[0].error, Some(EngineErrorKind::RateLimit));
        assert_eq!(report.attempts[1].error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_cancels_a_hung_attempt() {
        let policy = RetryPolicy {
            total_timeout: Duration::from_secs(2),
            ..policy()
        };
        let started = Instant::now();
        let report: RetryReport<()> = with_retry(&policy, |_ctx| async {
            time::sleep(Duration::from_secs(3600)).await;
            retry_result_ok(())
        })
        .await;

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(report.attempt_count(), 1);
        assert_eq!(report.result.unwrap_err().kind, EngineErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_sleep_past_the_deadline() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            total_timeout: Duration::from_secs(5),
        };
        let started = Instant::now();
        let report = with_retry(&policy, |_ctx| async {
            time::sleep(Duration::from_secs(2)).await;
            transient(EngineErrorKind::RateLimit)
        })
        .await;

        // First attempt ends at 2s; a 4s delay would end at 6s > 5s.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(report.attempt_count(), 1);
        assert_eq!(report.result.unwrap_err().kind, EngineErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_budgets_mean_no_deadline() {
        let policy = RetryPolicy {
            total_timeout: Duration::MAX,
            ..policy()
        };
        let report = with_retry(&policy, |ctx| async move {
            assert_eq!(ctx.remaining, Duration::MAX);
            if ctx.attempt < 3 {
                transient(EngineErrorKind::Timeout)
            } else {
                retry_result_ok(())
            }
        })
        .await;

        assert!(report.result.is_ok());
        assert_eq!(report.attempt_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_see_the_remaining_budget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _report = with_retry(&policy(), |ctx| {
            seen.lock().unwrap().push(ctx.remaining);
            async { transient(EngineErrorKind::Timeout) }
        })
        .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Duration::from_secs(10));
        assert_eq!(seen[1], Duration::from_millis(9_900));
        assert_eq!(seen[2], Duration::from_millis(9_750));
    }
}
