//! Lifecycle audit stream and system-wide error sink.
//!
//! - [`AuditSink`]: one structured record per job lifecycle event, consumed
//!   by operators and incident tooling. Never replayed.
//! - [`JsonlAuditSink`], [`MemoryAuditSink`], [`NullAuditSink`]: sink
//!   implementations.
//! - [`ErrorSink`]: engine failures that cannot be attributed to a job.

pub mod audit;
pub mod error_sink;
mod jsonl;

pub use audit::{
    AuditError, AuditEvent, AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink,
    NullAuditSink,
};
pub use error_sink::{ErrorRecord, ErrorSink};
