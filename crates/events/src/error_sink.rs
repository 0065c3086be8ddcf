//! System-wide sink for engine failures.
//!
//! Job failures go to the audit stream. Failures that abort a worker
//! process (store unreachable, lease I/O) have no job to attach to and are
//! appended here instead, one JSON line per failure, so every worker type
//! on the host reports into the same file.

use std::path::Path;

use chrono::{DateTime, Utc};
use medialib_core::audit::truncate_message;
use serde::{Deserialize, Serialize};

use crate::audit::AuditError;
use crate::jsonl::JsonlFile;

/// One engine failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub ts: DateTime<Utc>,
    /// Subsystem that failed, e.g. `lease`, `store`, `config`.
    pub component: String,
    pub worker_type: Option<String>,
    pub pid: u32,
    pub host: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(
        component: impl Into<String>,
        message: &str,
        host: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            ts,
            component: component.into(),
            worker_type: None,
            pid: std::process::id(),
            host: host.into(),
            message: truncate_message(message),
        }
    }

    pub fn with_worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }
}

/// Append-only JSONL file of [`ErrorRecord`]s.
#[derive(Debug)]
pub struct ErrorSink {
    file: JsonlFile,
}

impl ErrorSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Ok(Self {
            file: JsonlFile::open(path)?,
        })
    }

    pub fn record(&self, record: &ErrorRecord) -> Result<(), AuditError> {
        self.file.append(record)
    }

    /// Record a failure, logging instead of propagating if the sink itself
    /// fails. Used on exit paths where nothing else can be done.
    pub fn record_or_log(&self, record: &ErrorRecord) {
        if let Err(e) = self.record(record) {
            tracing::error!(
                error = %e,
                path = %self.file.path().display(),
                "Failed to write error sink record",
            );
        }
    }
}
