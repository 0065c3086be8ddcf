//! Applies [`RetryPolicy`] decisions to the job store.

use medialib_core::failure::JobFailure;
use medialib_core::retry::{RetryDecision, RetryPolicy};
use medialib_core::types::Timestamp;
use medialib_db::models::job::{Finalization, FinalizeResult, Job, RetrySchedule, RunningGuard};
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;

/// A retry decision together with what the store made of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRetry {
    pub decision: RetryDecision,
    pub result: FinalizeResult,
}

impl AppliedRetry {
    /// Whether the decision was written. `false` means the job had already
    /// moved on (finished, reaped or reclaimed) and nothing changed.
    pub fn applied(&self) -> bool {
        self.result.is_applied()
    }
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    pool: DbPool,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requeue `job` with backoff or mark it a terminal error.
    ///
    /// `guard` is the precondition the running row must still satisfy: the
    /// caller's claim for handler failures, or the observed heartbeat for
    /// reaped jobs.
    pub async fn handle_failure(
        &self,
        job: &Job,
        guard: &RunningGuard,
        failure: &JobFailure,
        now: Timestamp,
    ) -> Result<AppliedRetry, sqlx::Error> {
        let decision = self.policy.decide(job.attempt_count, failure.kind, now);

        let result = match decision {
            RetryDecision::Retry {
                attempt_count,
                not_before,
                delay,
            } => {
                tracing::info!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    attempt_count,
                    delay_secs = delay.as_secs(),
                    code = %failure.code,
                    "Scheduling retry",
                );
                let retry = RetrySchedule {
                    attempt_count,
                    not_before,
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                };
                JobRepo::schedule_retry_guarded(&self.pool, job.id, guard, &retry, now).await?
            }
            RetryDecision::Fail {
                attempt_count,
                non_retryable,
            } => {
                tracing::warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    attempt_count,
                    non_retryable,
                    code = %failure.code,
                    error = %failure.message,
                    "Job failed permanently",
                );
                let finalization = Finalization::Error {
                    attempt_count,
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                };
                JobRepo::finalize_guarded(&self.pool, job.id, guard, &finalization, now).await?
            }
        };

        Ok(AppliedRetry { decision, result })
    }
}
