use medialib_core::types::Timestamp;
use medialib_db::models::job::Job;
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;

/// Claims batches of jobs under one worker identity.
#[derive(Debug, Clone)]
pub struct JobClaimer {
    pool: DbPool,
    owner: String,
    job_types: Vec<String>,
    batch_size: usize,
}

impl JobClaimer {
    pub fn new(pool: DbPool, owner: impl Into<String>, job_types: Vec<String>, batch_size: usize) -> Self {
        Self {
            pool,
            owner: owner.into(),
            job_types,
            batch_size,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn job_types(&self) -> &[String] {
        &self.job_types
    }

    /// Claim up to `batch_size` eligible jobs, oldest first.
    pub async fn claim_next(&self, now: Timestamp) -> Result<Vec<Job>, sqlx::Error> {
        let jobs =
            JobRepo::claim_next(&self.pool, &self.job_types, self.batch_size, &self.owner, now)
                .await?;
        for job in &jobs {
            tracing::debug!(
                job_id = job.id,
                job_type = %job.job_type,
                owner = %self.owner,
                attempt_count = job.attempt_count,
                "Job claimed",
            );
        }
        Ok(jobs)
    }
}
