use medialib_events::AuditError;

use crate::config::ConfigError;
use crate::lease::LeaseError;

/// Engine-level failures. Any of these aborts the worker loop; handler
/// failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("sink error: {0}")]
    Sink(#[from] AuditError),
}

impl WorkerError {
    /// Short subsystem name used in the system-wide error sink.
    pub fn component(&self) -> &'static str {
        match self {
            WorkerError::Config(_) => "config",
            WorkerError::Store(_) | WorkerError::Migrate(_) => "store",
            WorkerError::Lease(_) => "lease",
            WorkerError::Sink(_) => "sink",
        }
    }
}
