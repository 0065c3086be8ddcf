//! The contract between the worker loop and per-job-type handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use medialib_core::clock::Clock;
use medialib_core::failure::JobFailure;
use medialib_core::types::{DbId, Timestamp};
use medialib_db::models::job::Job;
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;
use serde_json::Value;

use crate::cancellation::CancellationSignal;
use crate::trace::TraceScope;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a handler reports back for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done { result: Option<Value> },
    /// The retry scheduler decides between another attempt and a terminal
    /// error based on the failure kind.
    Failed(JobFailure),
    /// The handler observed a cancel request and stopped.
    Cancelled { reason: Option<String> },
}

impl Outcome {
    pub fn done(result: Value) -> Self {
        Outcome::Done {
            result: Some(result),
        }
    }

    pub fn failed(failure: JobFailure) -> Self {
        Outcome::Failed(failure)
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Outcome::Cancelled {
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Per-attempt services handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    owner: String,
    job_id: DbId,
    attempt: i32,
    cancel: CancellationSignal,
    trace: Option<TraceScope>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("owner", &self.owner)
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl JobContext {
    pub fn new(
        pool: DbPool,
        clock: Arc<dyn Clock>,
        owner: impl Into<String>,
        job: &Job,
        trace: Option<TraceScope>,
    ) -> Self {
        Self {
            cancel: CancellationSignal::new(pool.clone(), job.id),
            pool,
            clock,
            owner: owner.into(),
            job_id: job.id,
            attempt: job.attempt_count + 1,
            trace,
        }
    }

    pub fn job_id(&self) -> DbId {
        self.job_id
    }

    /// 1-based number of the attempt being executed.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// Poll the cancel flag. Store errors read as "not requested" so a
    /// flaky poll never aborts a healthy job.
    pub async fn is_cancel_requested(&self) -> bool {
        match self.cancel.is_requested().await {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!(job_id = self.job_id, error = %e, "Cancel flag poll failed");
                false
            }
        }
    }

    /// Record a progress marker. Returns `false` if the job is no longer
    /// held by this worker.
    pub async fn set_stage(&self, stage: &str) -> Result<bool, sqlx::Error> {
        JobRepo::set_stage(&self.pool, self.job_id, &self.owner, stage, self.clock.now()).await
    }

    /// Write a trace artifact for this attempt if tracing is enabled.
    pub async fn trace(&self, name: &str, doc: &Value) {
        let Some(scope) = &self.trace else {
            return;
        };
        if let Err(e) = scope.write(name, doc).await {
            tracing::warn!(job_id = self.job_id, name, error = %e, "Failed to write trace artifact");
        }
    }
}

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// Executes jobs of one or more types.
///
/// Handlers report failures through [`Outcome::Failed`]; panics are caught
/// by the worker loop and treated as fatal failures.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext, job: &Job) -> Outcome;
}

/// Maps job types to handlers, with an optional catch-all.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Handler used for job types without a dedicated registration.
    pub fn with_fallback(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(job_type)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl JobHandler for Fixed {
        async fn execute(&self, _ctx: &JobContext, _job: &Job) -> Outcome {
            Outcome::done(Value::String(self.0.to_string()))
        }
    }

    #[test]
    fn registry_prefers_exact_type_then_fallback() {
        let registry = HandlerRegistry::new().register("caption", Arc::new(Fixed("caption")));
        assert!(registry.get("caption").is_some());
        assert!(registry.get("scan").is_none());

        let registry = registry.with_fallback(Arc::new(Fixed("any")));
        assert!(registry.get("scan").is_some());
    }

    #[test]
    fn outcome_helpers() {
        assert_eq!(
            Outcome::cancelled("stop"),
            Outcome::Cancelled {
                reason: Some("stop".into())
            }
        );
        assert!(matches!(
            Outcome::failed(JobFailure::dependency("x")),
            Outcome::Failed(f) if f.is_retryable()
        ));
    }
}
