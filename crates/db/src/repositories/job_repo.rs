//! Repository for the `jobs` table.
//!
//! Claiming is optimistic: pick the oldest eligible row, then flip it to
//! `running` with an UPDATE that re-checks the status. Every transition out
//! of `running` is likewise conditional on `status = 'running'` plus a
//! [`RunningGuard`], so a worker whose job was reaped can never overwrite
//! the row.

use medialib_core::audit::truncate_message;
use medialib_core::job_status::JobStatus;
use medialib_core::types::{to_millis, DbId, Timestamp};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqlitePool};

use crate::models::job::{
    stages, EnqueueError, EnqueueJob, Finalization, FinalizeResult, Job, JobDescriptor,
    JobListQuery, RetrySchedule, RunningGuard,
};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, job_type, dedup_key, status, payload, result, \
    created_at, updated_at, heartbeat_at, attempt_count, not_before, \
    cancel_requested, cancelled_at, last_error_code, last_error_message, \
    owner, stage";

/// Maximum page size for job listing.
const MAX_LIMIT: i64 = 500;

/// Default page size for job listing.
const DEFAULT_LIMIT: i64 = 50;

/// Lost claim races tolerated for one batch slot before the batch ends early.
const MAX_CLAIM_CONFLICTS: u32 = 16;

/// Insert attempts when the deduped twin finishes before it can be looked up.
const MAX_ENQUEUE_ROUNDS: u32 = 3;

/// Code stored on jobs finalized as cancelled.
const CANCELLED_CODE: &str = "cancelled";

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn guard_clause(guard: &RunningGuard) -> &'static str {
    match guard {
        RunningGuard::Owner(_) => "owner = ?",
        RunningGuard::Observed { .. } => "heartbeat_at IS ? AND attempt_count = ?",
    }
}

fn bind_guard<'q>(query: SqliteQuery<'q>, guard: &'q RunningGuard) -> SqliteQuery<'q> {
    match guard {
        RunningGuard::Owner(owner) => query.bind(owner.as_str()),
        RunningGuard::Observed {
            heartbeat_at,
            attempt_count,
        } => query.bind(heartbeat_at.map(to_millis)).bind(*attempt_count),
    }
}

/// Provides the queue primitives for background jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job unless an active job with the same type and dedup
    /// key exists, in which case that job's id is returned with
    /// `deduped = true`.
    pub async fn enqueue(
        pool: &SqlitePool,
        input: &EnqueueJob,
        now: Timestamp,
    ) -> Result<JobDescriptor, EnqueueError> {
        input.validate()?;

        let payload = input.payload.to_string();
        let now_ms = to_millis(now);

        for round in 0..MAX_ENQUEUE_ROUNDS {
            let inserted = sqlx::query_scalar::<_, DbId>(
                "INSERT OR IGNORE INTO jobs \
                     (job_type, dedup_key, status, payload, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 RETURNING id",
            )
            .bind(&input.job_type)
            .bind(input.dedup_key.as_deref())
            .bind(input.initial_status.as_str())
            .bind(&payload)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(pool)
            .await?;

            if let Some(id) = inserted {
                tracing::debug!(
                    job_id = id,
                    job_type = %input.job_type,
                    dedup_key = ?input.dedup_key,
                    "Job enqueued",
                );
                return Ok(JobDescriptor { id, deduped: false });
            }

            if let Some(dedup_key) = input.dedup_key.as_deref() {
                if let Some(existing) =
                    Self::find_active_by_dedup_key(pool, &input.job_type, dedup_key).await?
                {
                    tracing::debug!(
                        job_id = existing,
                        job_type = %input.job_type,
                        dedup_key,
                        "Enqueue deduped against active job",
                    );
                    return Ok(JobDescriptor {
                        id: existing,
                        deduped: true,
                    });
                }
            }

            tracing::debug!(round, job_type = %input.job_type, "Enqueue collided, retrying");
        }

        Err(EnqueueError::Contended {
            job_type: input.job_type.clone(),
            dedup_key: input.dedup_key.clone(),
        })
    }

    /// Id of the active (pending, queued or running) job for a dedup key.
    pub async fn find_active_by_dedup_key(
        pool: &SqlitePool,
        job_type: &str,
        dedup_key: &str,
    ) -> Result<Option<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT id FROM jobs \
             WHERE job_type = ? AND dedup_key = ? \
               AND status IN ('pending', 'queued', 'running') \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(job_type)
        .bind(dedup_key)
        .fetch_optional(pool)
        .await
    }

    /// Claim up to `limit` eligible jobs of the given types for `owner`.
    ///
    /// Candidates are taken oldest-first. A conditional UPDATE that affects
    /// no row means another worker won that job; the next candidate is
    /// selected instead. Conflicts are never surfaced to the caller.
    pub async fn claim_next<S: AsRef<str>>(
        pool: &SqlitePool,
        types: &[S],
        limit: usize,
        owner: &str,
        now: Timestamp,
    ) -> Result<Vec<Job>, sqlx::Error> {
        if types.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let now_ms = to_millis(now);
        let placeholders = vec!["?"; types.len()].join(", ");
        let select = format!(
            "SELECT id FROM jobs \
             WHERE status IN ('pending', 'queued') \
               AND job_type IN ({placeholders}) \
               AND (not_before IS NULL OR not_before <= ?) \
             ORDER BY id ASC \
             LIMIT 1"
        );
        let update = format!(
            "UPDATE jobs \
             SET status = 'running', heartbeat_at = ?, updated_at = ?, owner = ?, stage = ? \
             WHERE id = ? AND status IN ('pending', 'queued') \
             RETURNING {COLUMNS}"
        );

        let mut claimed = Vec::with_capacity(limit);
        'slots: while claimed.len() < limit {
            let mut conflicts = 0u32;
            loop {
                let mut candidate_query = sqlx::query_scalar::<_, DbId>(&select);
                for job_type in types {
                    candidate_query = candidate_query.bind(job_type.as_ref());
                }
                let Some(candidate) = candidate_query.bind(now_ms).fetch_optional(pool).await?
                else {
                    break 'slots;
                };

                let won = sqlx::query_as::<_, Job>(&update)
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(owner)
                    .bind(stages::CLAIMED)
                    .bind(candidate)
                    .fetch_optional(pool)
                    .await?;

                match won {
                    Some(job) => {
                        claimed.push(job);
                        break;
                    }
                    None => {
                        conflicts += 1;
                        tracing::debug!(
                            job_id = candidate,
                            owner,
                            conflicts,
                            "Claim lost to another worker",
                        );
                        if conflicts >= MAX_CLAIM_CONFLICTS {
                            break 'slots;
                        }
                    }
                }
            }
        }

        Ok(claimed)
    }

    /// Refresh `heartbeat_at` on a job the caller still owns.
    ///
    /// Returns `false` when the job is no longer running under `owner`.
    pub async fn heartbeat(
        pool: &SqlitePool,
        job_id: DbId,
        owner: &str,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ?, updated_at = ? \
             WHERE id = ? AND owner = ? AND status = 'running'",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(job_id)
        .bind(owner)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a free-form progress marker on an owned, running job.
    pub async fn set_stage(
        pool: &SqlitePool,
        job_id: DbId,
        owner: &str,
        stage: &str,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET stage = ?, updated_at = ? \
             WHERE id = ? AND owner = ? AND status = 'running'",
        )
        .bind(stage)
        .bind(to_millis(now))
        .bind(job_id)
        .bind(owner)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move an owned, running job to a terminal state.
    pub async fn finalize(
        pool: &SqlitePool,
        job_id: DbId,
        owner: &str,
        finalization: &Finalization,
        now: Timestamp,
    ) -> Result<FinalizeResult, sqlx::Error> {
        Self::finalize_guarded(pool, job_id, &RunningGuard::owner(owner), finalization, now).await
    }

    /// Move a running job to a terminal state if `guard` still holds.
    ///
    /// Finalizing an already-terminal job is a logged no-op.
    pub async fn finalize_guarded(
        pool: &SqlitePool,
        job_id: DbId,
        guard: &RunningGuard,
        finalization: &Finalization,
        now: Timestamp,
    ) -> Result<FinalizeResult, sqlx::Error> {
        let now_ms = to_millis(now);
        let mut result_json: Option<String> = None;
        let mut attempt_count: Option<i32> = None;
        let mut error_code: Option<String> = None;
        let mut error_message: Option<String> = None;
        let mut cancelled_at: Option<i64> = None;
        let stage = match finalization {
            Finalization::Done { result } => {
                result_json = result.as_ref().map(Value::to_string);
                stages::FINISHED
            }
            Finalization::Error {
                attempt_count: attempts,
                code,
                message,
            } => {
                attempt_count = Some(*attempts);
                error_code = Some(code.clone());
                error_message = Some(truncate_message(message));
                stages::FAILED
            }
            Finalization::Cancelled { reason } => {
                cancelled_at = Some(now_ms);
                error_code = Some(CANCELLED_CODE.to_string());
                error_message = reason.as_deref().map(truncate_message);
                stages::CANCELLED
            }
        };

        let query = format!(
            "UPDATE jobs \
             SET status = ?, \
                 result = COALESCE(?, result), \
                 attempt_count = COALESCE(?, attempt_count), \
                 last_error_code = COALESCE(?, last_error_code), \
                 last_error_message = COALESCE(?, last_error_message), \
                 cancelled_at = ?, stage = ?, updated_at = ? \
             WHERE id = ? AND status = 'running' AND {}",
            guard_clause(guard)
        );
        let update = sqlx::query(&query)
            .bind(finalization.status().as_str())
            .bind(result_json)
            .bind(attempt_count)
            .bind(error_code)
            .bind(error_message)
            .bind(cancelled_at)
            .bind(stage)
            .bind(now_ms)
            .bind(job_id);
        let result = bind_guard(update, guard).execute(pool).await?;

        if result.rows_affected() == 1 {
            return Ok(FinalizeResult::Applied);
        }
        Self::explain_miss(pool, job_id, finalization.status()).await
    }

    /// Requeue an owned, running job after a retryable failure.
    pub async fn schedule_retry(
        pool: &SqlitePool,
        job_id: DbId,
        owner: &str,
        retry: &RetrySchedule,
        now: Timestamp,
    ) -> Result<FinalizeResult, sqlx::Error> {
        Self::schedule_retry_guarded(pool, job_id, &RunningGuard::owner(owner), retry, now).await
    }

    /// Requeue a running job if `guard` still holds. The claim is released:
    /// `owner` and `heartbeat_at` are cleared and `not_before` gates the
    /// next claim.
    pub async fn schedule_retry_guarded(
        pool: &SqlitePool,
        job_id: DbId,
        guard: &RunningGuard,
        retry: &RetrySchedule,
        now: Timestamp,
    ) -> Result<FinalizeResult, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status = 'queued', attempt_count = ?, not_before = ?, \
                 last_error_code = ?, last_error_message = ?, \
                 owner = NULL, heartbeat_at = NULL, stage = ?, updated_at = ? \
             WHERE id = ? AND status = 'running' AND {}",
            guard_clause(guard)
        );
        let update = sqlx::query(&query)
            .bind(retry.attempt_count)
            .bind(to_millis(retry.not_before))
            .bind(&retry.code)
            .bind(truncate_message(&retry.message))
            .bind(stages::RETRY_SCHEDULED)
            .bind(to_millis(now))
            .bind(job_id);
        let result = bind_guard(update, guard).execute(pool).await?;

        if result.rows_affected() == 1 {
            return Ok(FinalizeResult::Applied);
        }
        Self::explain_miss(pool, job_id, JobStatus::Queued).await
    }

    /// Work out why a guarded transition matched no row.
    async fn explain_miss(
        pool: &SqlitePool,
        job_id: DbId,
        target: JobStatus,
    ) -> Result<FinalizeResult, sqlx::Error> {
        let Some(current) = Self::find_by_id(pool, job_id).await? else {
            tracing::warn!(job_id, target = %target, "Transition on missing job ignored");
            return Ok(FinalizeResult::Missing);
        };
        if current.status.is_terminal() {
            tracing::warn!(
                job_id,
                status = %current.status,
                target = %target,
                "Job already terminal, duplicate completion ignored",
            );
            return Ok(FinalizeResult::AlreadyTerminal(current.status));
        }
        tracing::warn!(
            job_id,
            status = %current.status,
            owner = ?current.owner,
            target = %target,
            "Job no longer held by caller, transition ignored",
        );
        Ok(FinalizeResult::NotOwner)
    }

    /// Running jobs whose heartbeat is older than `cutoff`.
    pub async fn find_stuck(
        pool: &SqlitePool,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status = 'running' \
               AND (heartbeat_at IS NULL OR heartbeat_at < ?) \
             ORDER BY id ASC \
             LIMIT ?"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(to_millis(cutoff))
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Find a job by its internal ID.
    pub async fn find_by_id(pool: &SqlitePool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List jobs, newest first, with optional status and type filters.
    pub async fn list(pool: &SqlitePool, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);
        let status = params.status.map(JobStatus::as_str);

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR status = ?1) \
               AND (?2 IS NULL OR job_type = ?2) \
             ORDER BY id DESC \
             LIMIT ?3 OFFSET ?4"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(status)
            .bind(params.job_type.as_deref())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Flag a non-terminal job for cooperative cancellation.
    ///
    /// Returns `false` when the job does not exist or is already terminal.
    pub async fn request_cancel(
        pool: &SqlitePool,
        job_id: DbId,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ? \
             WHERE id = ? AND status IN ('pending', 'queued', 'running')",
        )
        .bind(to_millis(now))
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether cancellation has been requested for a job.
    pub async fn cancel_requested(pool: &SqlitePool, job_id: DbId) -> Result<bool, sqlx::Error> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    /// Hand an owned, running job back to the queue without counting an
    /// attempt. Used for claimed jobs a worker will not start, e.g. on
    /// shutdown or after losing its lease.
    pub async fn release_claim(
        pool: &SqlitePool,
        job_id: DbId,
        owner: &str,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status = 'queued', owner = NULL, heartbeat_at = NULL, \
                 stage = ?, updated_at = ? \
             WHERE id = ? AND owner = ? AND status = 'running'",
        )
        .bind(stages::RELEASED)
        .bind(to_millis(now))
        .bind(job_id)
        .bind(owner)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Finalize an owned, running job as cancelled.
    pub async fn mark_cancelled(
        pool: &SqlitePool,
        job_id: DbId,
        owner: &str,
        reason: Option<&str>,
        now: Timestamp,
    ) -> Result<FinalizeResult, sqlx::Error> {
        let finalization = Finalization::Cancelled {
            reason: reason.map(str::to_string),
        };
        Self::finalize(pool, job_id, owner, &finalization, now).await
    }
}
