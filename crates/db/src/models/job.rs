//! Job entity and the inputs/outcomes of job state transitions.

use medialib_core::error::CoreError;
use medialib_core::job_status::JobStatus;
use medialib_core::payload::JobPayload;
use medialib_core::types::{from_millis, DbId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// Progress markers written to `jobs.stage` by the engine itself.
pub mod stages {
    pub const CLAIMED: &str = "claimed";
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    pub const FINISHED: &str = "finished";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
    pub const FORCE_CANCELLED: &str = "force_cancelled";
    pub const RELEASED: &str = "released";
}

/// A row from the `jobs` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: DbId,
    pub job_type: String,
    pub dedup_key: Option<String>,
    pub status: JobStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub heartbeat_at: Option<Timestamp>,
    pub attempt_count: i32,
    pub not_before: Option<Timestamp>,
    pub cancel_requested: bool,
    pub cancelled_at: Option<Timestamp>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub owner: Option<String>,
    pub stage: Option<String>,
}

impl Job {
    /// Decode the payload through the schema for this job's type.
    pub fn typed_payload(&self) -> Result<JobPayload, CoreError> {
        JobPayload::decode(&self.job_type, &self.payload)
    }

    /// Correlated domain entity, when the payload names one.
    pub fn entity_ref(&self) -> Option<String> {
        self.typed_payload().ok().and_then(|p| p.entity_ref())
    }
}

fn decode_err(
    column: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(source),
    }
}

fn opt_millis(row: &SqliteRow, column: &str) -> Result<Option<Timestamp>, sqlx::Error> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(from_millis))
}

fn opt_json(row: &SqliteRow, column: &str) -> Result<Option<Value>, sqlx::Error> {
    row.try_get::<Option<String>, _>(column)?
        .map(|text| serde_json::from_str(&text).map_err(|e| decode_err(column, e)))
        .transpose()
}

impl<'r> FromRow<'r, SqliteRow> for Job {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<JobStatus>()
            .map_err(|e| decode_err("status", e))?;
        let payload: String = row.try_get("payload")?;
        let payload = serde_json::from_str(&payload).map_err(|e| decode_err("payload", e))?;

        Ok(Job {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            dedup_key: row.try_get("dedup_key")?,
            status,
            payload,
            result: opt_json(row, "result")?,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
            heartbeat_at: opt_millis(row, "heartbeat_at")?,
            attempt_count: row.try_get("attempt_count")?,
            not_before: opt_millis(row, "not_before")?,
            cancel_requested: row.try_get("cancel_requested")?,
            cancelled_at: opt_millis(row, "cancelled_at")?,
            last_error_code: row.try_get("last_error_code")?,
            last_error_message: row.try_get("last_error_message")?,
            owner: row.try_get("owner")?,
            stage: row.try_get("stage")?,
        })
    }
}

/// Input for `JobRepo::enqueue`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueJob {
    pub job_type: String,
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// `pending` or `queued`. Defaults to `queued`.
    #[serde(default = "default_initial_status")]
    pub initial_status: JobStatus,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn default_initial_status() -> JobStatus {
    JobStatus::Queued
}

impl EnqueueJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            dedup_key: None,
            payload,
            initial_status: JobStatus::Queued,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn pending(mut self) -> Self {
        self.initial_status = JobStatus::Pending;
        self
    }

    /// Check the job type, the initial status and, for known job types,
    /// the payload shape.
    pub fn validate(&self) -> Result<(), CoreError> {
        medialib_core::payload::validate_job_type(&self.job_type)?;
        if !self.initial_status.is_claimable() {
            return Err(CoreError::Validation(format!(
                "initial status must be pending or queued, got {}",
                self.initial_status
            )));
        }
        if matches!(&self.dedup_key, Some(key) if key.trim().is_empty()) {
            return Err(CoreError::Validation(
                "dedup key must not be blank".to_string(),
            ));
        }
        JobPayload::decode(&self.job_type, &self.payload)?;
        Ok(())
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub id: DbId,
    /// `true` when an active job with the same type and dedup key already
    /// existed and no row was created.
    pub deduped: bool,
}

/// Errors from `JobRepo::enqueue`.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The insert kept colliding with a twin that finished before it could
    /// be looked up.
    #[error("enqueue of {job_type} job with dedup key {dedup_key:?} kept conflicting")]
    Contended {
        job_type: String,
        dedup_key: Option<String>,
    },
}

/// Terminal state written by `JobRepo::finalize`.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    Done {
        result: Option<Value>,
    },
    Error {
        /// Attempt count including the failed attempt.
        attempt_count: i32,
        code: String,
        message: String,
    },
    Cancelled {
        reason: Option<String>,
    },
}

impl Finalization {
    pub fn status(&self) -> JobStatus {
        match self {
            Finalization::Done { .. } => JobStatus::Done,
            Finalization::Error { .. } => JobStatus::Error,
            Finalization::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}

/// Outcome of a finalize call. Never an error for duplicate reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeResult {
    Applied,
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(JobStatus),
    /// The job is no longer running under the caller's claim (reaped,
    /// requeued or claimed by another worker).
    NotOwner,
    /// No such job.
    Missing,
}

impl FinalizeResult {
    pub fn is_applied(self) -> bool {
        matches!(self, FinalizeResult::Applied)
    }
}

/// Requeue instructions written by `JobRepo::schedule_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySchedule {
    pub attempt_count: i32,
    pub not_before: Timestamp,
    pub code: String,
    pub message: String,
}

/// Precondition on a running job that every transition out of `running`
/// must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub enum RunningGuard {
    /// The caller holds the claim.
    Owner(String),
    /// The caller observed the job as stale: its heartbeat and attempt
    /// count must be unchanged since then.
    Observed {
        heartbeat_at: Option<Timestamp>,
        attempt_count: i32,
    },
}

impl RunningGuard {
    pub fn owner(owner: impl Into<String>) -> Self {
        RunningGuard::Owner(owner.into())
    }

    pub fn observed(job: &Job) -> Self {
        RunningGuard::Observed {
            heartbeat_at: job.heartbeat_at,
            attempt_count: job.attempt_count,
        }
    }
}

/// Query parameters for `JobRepo::list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    /// Maximum number of results. Defaults to 50, capped at 500.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn enqueue_defaults_to_queued() {
        let input: EnqueueJob =
            serde_json::from_value(json!({"job_type": "caption", "payload": {"media_id": 7}}))
                .unwrap();
        assert_eq!(input.initial_status, JobStatus::Queued);
        assert!(input.validate().is_ok());
    }

    #[test]
    fn enqueue_rejects_terminal_initial_status() {
        let mut input = EnqueueJob::new("scan", json!({"root": "/lib"}));
        input.initial_status = JobStatus::Done;
        assert_matches!(input.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn enqueue_rejects_malformed_known_payload() {
        let input = EnqueueJob::new("caption", json!({"prompt": "no media id"}));
        assert_matches!(input.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn enqueue_accepts_unknown_type_verbatim() {
        let input = EnqueueJob::new("log_incident", json!(["anything"])).with_dedup_key("x");
        assert!(input.validate().is_ok());
    }

    #[test]
    fn enqueue_rejects_blank_dedup_key() {
        let input = EnqueueJob::new("log_incident", json!({})).with_dedup_key("  ");
        assert_matches!(input.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn finalization_maps_to_terminal_status() {
        assert_eq!(Finalization::Done { result: None }.status(), JobStatus::Done);
        assert!(Finalization::Cancelled { reason: None }.status().is_terminal());
    }
}
