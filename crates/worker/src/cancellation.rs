use medialib_core::types::DbId;
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;

/// Handler-facing view of a job's cancel flag.
///
/// Cancellation is cooperative: handlers poll [`is_requested`] at points
/// where stopping is safe and return `Outcome::Cancelled`. A handler that
/// never polls runs to completion.
///
/// [`is_requested`]: CancellationSignal::is_requested
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    pool: DbPool,
    job_id: DbId,
}

impl CancellationSignal {
    pub fn new(pool: DbPool, job_id: DbId) -> Self {
        Self { pool, job_id }
    }

    pub fn job_id(&self) -> DbId {
        self.job_id
    }

    pub async fn is_requested(&self) -> Result<bool, sqlx::Error> {
        JobRepo::cancel_requested(&self.pool, self.job_id).await
    }
}
