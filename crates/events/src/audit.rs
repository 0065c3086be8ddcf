//! Job lifecycle audit records and sinks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use medialib_core::audit::{event_types, payload_preview, truncate_message};
use medialib_core::types::DbId;
use serde::{Deserialize, Serialize};

use crate::jsonl::JsonlFile;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit sink lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEvent {
    Enqueue,
    Start,
    Success,
    Retry,
    Error,
    Cancel,
    Reap,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Enqueue => event_types::ENQUEUE,
            AuditEvent::Start => event_types::START,
            AuditEvent::Success => event_types::SUCCESS,
            AuditEvent::Retry => event_types::RETRY,
            AuditEvent::Error => event_types::ERROR,
            AuditEvent::Cancel => event_types::CANCEL,
            AuditEvent::Reap => event_types::REAP,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// One line of the audit stream.
///
/// Constructed via [`AuditRecord::new`] and enriched with the `with_*`
/// builder methods. Payloads passed to [`with_payload`](Self::with_payload)
/// are reduced to a redacted preview before they are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub event: AuditEvent,
    pub job_id: DbId,
    pub job_type: String,

    /// Correlated domain entity, e.g. `media:7`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_preview: Option<serde_json::Value>,

    /// Event-specific extras such as the retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditRecord {
    pub fn new(
        event: AuditEvent,
        job_id: DbId,
        job_type: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            ts,
            event,
            job_id,
            job_type: job_type.into(),
            entity: None,
            attempt: None,
            owner: None,
            error_code: None,
            error_message: None,
            payload_preview: None,
            detail: None,
        }
    }

    pub fn with_entity(mut self, entity: Option<String>) -> Self {
        self.entity = entity;
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: &str) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(truncate_message(message));
        self
    }

    /// Attach a redacted, size-bounded preview of `payload`.
    pub fn with_payload(mut self, payload: &serde_json::Value) -> Self {
        self.payload_preview = Some(payload_preview(payload));
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for audit records.
///
/// A failing sink must never fail the job: callers log the error and move on.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Appends records as JSON lines to a file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    file: JsonlFile,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Ok(Self {
            file: JsonlFile::open(path)?,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.file.append(record)
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Events recorded for one job, in order.
    pub fn events_for(&self, job_id: DbId) -> Vec<AuditEvent> {
        self.records()
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .map(|r| r.event)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .map_err(|_| AuditError::Poisoned)?
            .push(record.clone());
        Ok(())
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn record_serializes_without_empty_fields() {
        let record = AuditRecord::new(AuditEvent::Enqueue, 1, "caption", ts());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "enqueue");
        assert_eq!(value["job_type"], "caption");
        assert!(value.get("error_code").is_none());
        assert!(value.get("owner").is_none());
    }

    #[test]
    fn payload_is_previewed_not_copied() {
        let record = AuditRecord::new(AuditEvent::Start, 1, "caption", ts())
            .with_payload(&json!({"media_id": 7, "api_key": "sk-123"}));
        let preview = record.payload_preview.unwrap();
        assert_eq!(preview["media_id"], 7);
        assert_eq!(preview["api_key"], "[REDACTED]");
    }

    #[test]
    fn memory_sink_collects_events_per_job() {
        let sink = MemoryAuditSink::new();
        sink.record(&AuditRecord::new(AuditEvent::Enqueue, 1, "caption", ts())).unwrap();
        sink.record(&AuditRecord::new(AuditEvent::Enqueue, 2, "caption", ts())).unwrap();
        sink.record(&AuditRecord::new(AuditEvent::Start, 1, "caption", ts())).unwrap();
        assert_eq!(sink.events_for(1), vec![AuditEvent::Enqueue, AuditEvent::Start]);
        assert_eq!(sink.records().len(), 3);
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(AuditEvent::Reap.to_string(), "reap");
        assert_eq!(serde_json::to_value(AuditEvent::Retry).unwrap(), json!("retry"));
    }
}
