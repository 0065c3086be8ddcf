//! Retry and backoff policy.
//!
//! Pure decision logic: given how many attempts a job has already used and
//! how the latest attempt failed, decide between another attempt (with a
//! `not_before` gate) and a terminal error. Persisting the decision is the
//! worker's job.

use std::time::Duration;

use crate::failure::FailureKind;
use crate::types::Timestamp;

/// Default number of attempts before a job is marked as a terminal error.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(30);

/// Default ceiling on a single retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job; it becomes claimable again at `not_before`.
    Retry {
        attempt_count: i32,
        delay: Duration,
        not_before: Timestamp,
    },
    /// Mark the job as a terminal error.
    Fail {
        attempt_count: i32,
        /// `true` when the failure class bypassed the attempt budget.
        non_retryable: bool,
    },
}

impl RetryDecision {
    pub fn attempt_count(&self) -> i32 {
        match *self {
            RetryDecision::Retry { attempt_count, .. } => attempt_count,
            RetryDecision::Fail { attempt_count, .. } => attempt_count,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failure number `attempt` (1-based).
    ///
    /// `base * 2^(attempt - 1)`, saturating and capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `previous_attempts` is the job's `attempt_count` before this failure.
    /// A retryable job reaches a terminal error after exactly
    /// `max_attempts` failures.
    pub fn decide(&self, previous_attempts: i32, kind: FailureKind, now: Timestamp) -> RetryDecision {
        let attempt_count = previous_attempts.max(0).saturating_add(1);

        if !kind.is_retryable() {
            return RetryDecision::Fail {
                attempt_count,
                non_retryable: true,
            };
        }

        let max_attempts = self.max_attempts.max(1);
        if (attempt_count as u32) >= max_attempts {
            return RetryDecision::Fail {
                attempt_count,
                non_retryable: false,
            };
        }

        let delay = self.backoff_for(attempt_count as u32);
        let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let not_before = now
            .checked_add_signed(step)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

        RetryDecision::Retry {
            attempt_count,
            delay,
            not_before,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn now() -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap()
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(3600),
        }
    }

    // -- backoff_for ----------------------------------------------------------

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy(5);
        assert_eq!(p.backoff_for(1), Duration::from_secs(10));
        assert_eq!(p.backoff_for(2), Duration::from_secs(20));
        assert_eq!(p.backoff_for(3), Duration::from_secs(40));
        assert_eq!(p.backoff_for(4), Duration::from_secs(80));
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy(100);
        assert_eq!(p.backoff_for(20), Duration::from_secs(3600));
        assert_eq!(p.backoff_for(64), Duration::from_secs(3600));
    }

    // -- decide ---------------------------------------------------------------

    #[test]
    fn first_retryable_failure_schedules_retry() {
        let decision = policy(3).decide(0, FailureKind::Dependency, now());
        assert_matches!(
            decision,
            RetryDecision::Retry { attempt_count: 1, delay, not_before }
                if delay == Duration::from_secs(10)
                    && not_before == now() + chrono::Duration::seconds(10)
        );
    }

    #[test]
    fn terminal_after_exactly_max_attempts_failures() {
        let p = policy(3);
        assert!(p.decide(0, FailureKind::Dependency, now()).is_retry());
        assert!(p.decide(1, FailureKind::Dependency, now()).is_retry());
        assert_matches!(
            p.decide(2, FailureKind::Dependency, now()),
            RetryDecision::Fail { attempt_count: 3, non_retryable: false }
        );
    }

    #[test]
    fn not_before_strictly_increases_between_retries() {
        let p = policy(6);
        let mut previous = None;
        for attempts in 0..5 {
            let RetryDecision::Retry { not_before, .. } =
                p.decide(attempts, FailureKind::Dependency, now())
            else {
                panic!("expected retry for attempt {attempts}");
            };
            if let Some(prev) = previous {
                assert!(not_before > prev);
            }
            previous = Some(not_before);
        }
    }

    #[test]
    fn validation_bypasses_attempt_budget() {
        assert_matches!(
            policy(10).decide(0, FailureKind::Validation, now()),
            RetryDecision::Fail { attempt_count: 1, non_retryable: true }
        );
    }

    #[test]
    fn non_retryable_resource_fails_immediately() {
        assert_matches!(
            policy(10).decide(0, FailureKind::Resource { retryable: false }, now()),
            RetryDecision::Fail { non_retryable: true, .. }
        );
    }

    #[test]
    fn zero_max_attempts_behaves_as_one() {
        assert_matches!(
            policy(0).decide(0, FailureKind::Dependency, now()),
            RetryDecision::Fail { attempt_count: 1, non_retryable: false }
        );
    }
}
