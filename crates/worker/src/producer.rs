//! Enqueue with an audit trail.

use medialib_core::payload::JobPayload;
use medialib_core::types::Timestamp;
use medialib_db::models::job::{EnqueueError, EnqueueJob, JobDescriptor};
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;
use medialib_events::{AuditEvent, AuditRecord, AuditSink};

/// Enqueue `input` and record an `enqueue` audit event when a new row was
/// created. Deduplicated requests are logged but not audited.
pub async fn enqueue(
    pool: &DbPool,
    audit: &dyn AuditSink,
    input: &EnqueueJob,
    now: Timestamp,
) -> Result<JobDescriptor, EnqueueError> {
    let descriptor = JobRepo::enqueue(pool, input, now).await?;

    if descriptor.deduped {
        tracing::debug!(
            job_id = descriptor.id,
            job_type = %input.job_type,
            dedup_key = ?input.dedup_key,
            "Enqueue deduplicated against active job",
        );
        return Ok(descriptor);
    }

    let entity = JobPayload::decode(&input.job_type, &input.payload)
        .ok()
        .and_then(|payload| payload.entity_ref());
    let mut record = AuditRecord::new(AuditEvent::Enqueue, descriptor.id, &input.job_type, now)
        .with_entity(entity)
        .with_payload(&input.payload);
    if let Some(key) = &input.dedup_key {
        record = record.with_detail(serde_json::json!({ "dedup_key": key }));
    }
    if let Err(e) = audit.record(&record) {
        tracing::warn!(job_id = descriptor.id, error = %e, "Failed to write audit record");
    }

    tracing::info!(job_id = descriptor.id, job_type = %input.job_type, "Job enqueued");
    Ok(descriptor)
}
