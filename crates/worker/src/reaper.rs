//! Reclaims running jobs whose owner stopped heart-beating.

use std::time::Duration;

use medialib_core::failure::{codes, JobFailure};
use medialib_core::types::Timestamp;
use medialib_db::models::job::{Job, RunningGuard};
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;

use crate::retry::{AppliedRetry, RetryScheduler};

/// Stuck jobs handled per sweep.
const DEFAULT_BATCH_LIMIT: i64 = 100;

/// A job this sweep moved out of `running`.
#[derive(Debug, Clone)]
pub struct ReapedJob {
    /// The row as observed before it was reclaimed.
    pub job: Job,
    pub applied: AppliedRetry,
}

#[derive(Debug, Default)]
pub struct ReapReport {
    pub examined: usize,
    pub reaped: Vec<ReapedJob>,
    /// Candidates that changed between selection and update (finished,
    /// heart-beat or reaped by a concurrent sweep).
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct StuckJobReaper {
    pool: DbPool,
    scheduler: RetryScheduler,
    threshold: Duration,
    batch_limit: i64,
}

impl StuckJobReaper {
    pub fn new(pool: DbPool, scheduler: RetryScheduler, threshold: Duration) -> Self {
        Self {
            pool,
            scheduler,
            threshold,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Route every running job silent since before `now - threshold`
    /// through the retry scheduler as a dependency failure.
    ///
    /// Each transition is conditional on the heartbeat and attempt count
    /// observed here, so overlapping sweeps reclaim a stale period once.
    pub async fn sweep(&self, now: Timestamp) -> Result<ReapReport, sqlx::Error> {
        let cutoff = chrono::Duration::from_std(self.threshold)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let candidates = JobRepo::find_stuck(&self.pool, cutoff, self.batch_limit).await?;
        let mut report = ReapReport {
            examined: candidates.len(),
            ..ReapReport::default()
        };

        for job in candidates {
            let last_seen = job
                .heartbeat_at
                .map(|hb| hb.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let failure = JobFailure::dependency(format!(
                "no heartbeat since {last_seen} from {}",
                job.owner.as_deref().unwrap_or("unknown owner")
            ))
            .with_code(codes::STUCK_JOB);

            let guard = RunningGuard::observed(&job);
            let applied = self
                .scheduler
                .handle_failure(&job, &guard, &failure, now)
                .await?;

            if applied.applied() {
                tracing::warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    owner = ?job.owner,
                    requeued = applied.decision.is_retry(),
                    attempt_count = applied.decision.attempt_count(),
                    "Reaped stuck job",
                );
                report.reaped.push(ReapedJob { job, applied });
            } else {
                tracing::debug!(job_id = job.id, "Stuck job changed before reap, skipped");
                report.skipped += 1;
            }
        }

        Ok(report)
    }
}
