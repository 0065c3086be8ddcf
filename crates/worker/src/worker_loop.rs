//! The per-process polling loop.
//!
//! Each tick reaps stuck jobs, claims a batch, and runs the claimed jobs
//! one at a time: ownership check, handler under a heartbeat task, then
//! finalize directly or through the retry scheduler. Handler failures and
//! panics are job outcomes; only store, lease and sink failures abort the
//! loop.

use std::sync::Arc;
use std::time::Duration;

use medialib_core::clock::Clock;
use medialib_core::failure::{codes, JobFailure};
use medialib_core::retry::{RetryDecision, RetryPolicy};
use medialib_core::types::DbId;
use medialib_db::models::job::{Finalization, FinalizeResult, Job, RunningGuard};
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;
use medialib_events::{AuditEvent, AuditRecord, AuditSink};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::claimer::JobClaimer;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::{HandlerRegistry, JobContext, Outcome};
use crate::heartbeat::HeartbeatTask;
use crate::lease::{LeaseError, WorkerLease};
use crate::reaper::{ReapedJob, StuckJobReaper};
use crate::retry::RetryScheduler;
use crate::trace::TraceWriter;

/// Loop tuning taken from [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub job_types: Vec<String>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stuck_threshold: Duration,
    pub retry: RetryPolicy,
    pub run_once: bool,
}

impl LoopSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            job_types: config.job_types.clone(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            stuck_threshold: config.stuck_threshold,
            retry: config.retry,
            run_once: config.run_once,
        }
    }
}

/// Counters for one tick, or accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Outcomes not written because the job had already moved on.
    pub superseded: usize,
    /// Claims handed back unstarted on shutdown or lease loss.
    pub released: usize,
}

impl TickReport {
    /// Nothing was reaped or claimed.
    pub fn is_idle(&self) -> bool {
        self.reaped == 0 && self.claimed == 0
    }

    pub fn merge(&mut self, other: &TickReport) {
        self.reaped += other.reaped;
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.superseded += other.superseded;
        self.released += other.released;
    }
}

pub struct WorkerLoop {
    pool: DbPool,
    lease: Arc<WorkerLease>,
    clock: Arc<dyn Clock>,
    registry: HandlerRegistry,
    audit: Arc<dyn AuditSink>,
    claimer: JobClaimer,
    scheduler: RetryScheduler,
    reaper: StuckJobReaper,
    trace: Option<TraceWriter>,
    settings: LoopSettings,
    shutdown: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        pool: DbPool,
        lease: Arc<WorkerLease>,
        clock: Arc<dyn Clock>,
        registry: HandlerRegistry,
        audit: Arc<dyn AuditSink>,
        settings: LoopSettings,
    ) -> Self {
        let claimer = JobClaimer::new(
            pool.clone(),
            lease.owner_id(),
            settings.job_types.clone(),
            settings.batch_size,
        );
        let scheduler = RetryScheduler::new(pool.clone(), settings.retry);
        let reaper = StuckJobReaper::new(pool.clone(), scheduler.clone(), settings.stuck_threshold);
        Self {
            pool,
            lease,
            clock,
            registry,
            audit,
            claimer,
            scheduler,
            reaper,
            trace: None,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Write per-attempt trace artifacts under `writer`'s root.
    pub fn with_trace_writer(mut self, writer: TraceWriter) -> Self {
        self.trace = Some(writer);
        self
    }

    /// Token that stops [`run`](Self::run) after the current job.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn owner(&self) -> &str {
        self.claimer.owner()
    }

    /// Loop until shutdown, lease loss or an engine failure.
    pub async fn run(&self) -> Result<TickReport, WorkerError> {
        let mut total = TickReport::default();
        tracing::info!(
            owner = %self.owner(),
            job_types = ?self.settings.job_types,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            run_once = self.settings.run_once,
            "Worker loop started",
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let report = self.tick().await?;
            total.merge(&report);

            if self.settings.run_once {
                break;
            }
            if report.is_idle() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        tracing::info!(
            succeeded = total.succeeded,
            retried = total.retried,
            failed = total.failed,
            cancelled = total.cancelled,
            "Worker loop stopped",
        );
        Ok(total)
    }

    /// One reap / claim / execute cycle.
    pub async fn tick(&self) -> Result<TickReport, WorkerError> {
        let mut report = TickReport::default();

        self.lease.renew()?;

        let reaped = self.reaper.sweep(self.clock.now()).await?;
        for reaped_job in &reaped.reaped {
            self.audit_reap(reaped_job);
        }
        report.reaped = reaped.reaped.len();

        let jobs = self.claimer.claim_next(self.clock.now()).await?;
        report.claimed = jobs.len();

        let mut batch = jobs.into_iter();
        while let Some(job) = batch.next() {
            if self.shutdown.is_cancelled() {
                report.released += self.release(std::iter::once(job).chain(batch)).await?;
                break;
            }

            let waiting: Vec<DbId> = batch.as_slice().iter().map(|j| j.id).collect();
            let lease_lost = self.process(job, waiting, &mut report).await?;
            if lease_lost {
                report.released += self.release(batch).await?;
                return Err(WorkerError::Lease(LeaseError::Lost {
                    worker_type: self.lease.worker_type(),
                }));
            }
        }

        Ok(report)
    }

    /// Run one claimed job to a recorded outcome. `waiting` are the batch's
    /// later claims, kept alive while this one runs. Returns whether the
    /// lease was lost while it ran.
    async fn process(
        &self,
        job: Job,
        waiting: Vec<DbId>,
        report: &mut TickReport,
    ) -> Result<bool, WorkerError> {
        let owner = self.owner().to_string();
        let attempt = job.attempt_count + 1;

        // The claim may have waited behind earlier jobs in the batch and been
        // reaped or cancelled by someone else in the meantime.
        if !JobRepo::heartbeat(&self.pool, job.id, &owner, self.clock.now()).await? {
            tracing::warn!(job_id = job.id, owner = %owner, "Claim lost before start, skipping");
            report.superseded += 1;
            return Ok(false);
        }

        if job.cancel_requested {
            tracing::info!(job_id = job.id, "Cancel requested before start, skipping handler");
            let outcome = Outcome::cancelled("cancel requested before start");
            self.apply(&job, attempt, outcome, report).await?;
            return Ok(false);
        }

        let mut lease_lost = false;
        let outcome = match (self.registry.get(&job.job_type), job.typed_payload()) {
            (None, _) => Outcome::Failed(
                JobFailure::config(format!("no handler registered for job type {}", job.job_type))
                    .with_code(codes::NO_HANDLER),
            ),
            (Some(_), Err(e)) => Outcome::Failed(JobFailure::validation(e.to_string())),
            (Some(handler), Ok(_)) => {
                self.record_audit(
                    AuditRecord::new(AuditEvent::Start, job.id, &job.job_type, self.clock.now())
                        .with_entity(job.entity_ref())
                        .with_attempt(attempt)
                        .with_owner(&owner)
                        .with_payload(&job.payload),
                );

                let scope = self
                    .trace
                    .as_ref()
                    .map(|writer| writer.scope(&job.job_type, job.id, attempt));
                let ctx = JobContext::new(
                    self.pool.clone(),
                    Arc::clone(&self.clock),
                    owner.clone(),
                    &job,
                    scope,
                );
                ctx.trace("job", &json!(job)).await;

                let heartbeat = HeartbeatTask::spawn(
                    Arc::clone(&self.lease),
                    self.pool.clone(),
                    Arc::clone(&self.clock),
                    job.id,
                    waiting,
                    owner.clone(),
                    self.settings.heartbeat_interval,
                );

                let task = {
                    let ctx = ctx.clone();
                    let job = job.clone();
                    tokio::spawn(async move { handler.execute(&ctx, &job).await })
                };
                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        tracing::error!(job_id = job.id, panic = %message, "Handler panicked");
                        Outcome::Failed(
                            JobFailure::fatal(format!("handler panicked: {message}"))
                                .with_code(codes::HANDLER_PANIC),
                        )
                    }
                    Err(e) => Outcome::Failed(JobFailure::fatal(format!(
                        "handler task aborted: {e}"
                    ))),
                };

                let summary = heartbeat.stop().await;
                lease_lost = summary.lease_lost;
                ctx.trace("outcome", &outcome_trace(&outcome)).await;
                outcome
            }
        };

        self.apply(&job, attempt, outcome, report).await?;
        Ok(lease_lost)
    }

    /// Persist an outcome and audit whatever was actually written.
    async fn apply(
        &self,
        job: &Job,
        attempt: i32,
        outcome: Outcome,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        let owner = self.owner();
        let now = self.clock.now();
        let record = |event| {
            AuditRecord::new(event, job.id, &job.job_type, now)
                .with_entity(job.entity_ref())
                .with_attempt(attempt)
                .with_owner(owner)
        };

        match outcome {
            Outcome::Done { result } => {
                let finalization = Finalization::Done { result };
                let written = JobRepo::finalize(&self.pool, job.id, owner, &finalization, now).await?;
                if self.count_superseded(job, written, report) {
                    return Ok(());
                }
                tracing::info!(job_id = job.id, job_type = %job.job_type, attempt, "Job done");
                report.succeeded += 1;
                self.record_audit(record(AuditEvent::Success));
            }
            Outcome::Cancelled { reason } => {
                let written =
                    JobRepo::mark_cancelled(&self.pool, job.id, owner, reason.as_deref(), now)
                        .await?;
                if self.count_superseded(job, written, report) {
                    return Ok(());
                }
                tracing::info!(job_id = job.id, job_type = %job.job_type, "Job cancelled");
                report.cancelled += 1;
                let mut cancel = record(AuditEvent::Cancel);
                if let Some(reason) = reason {
                    cancel = cancel.with_detail(json!({ "reason": reason }));
                }
                self.record_audit(cancel);
            }
            Outcome::Failed(failure) => {
                let guard = RunningGuard::owner(owner);
                let applied = self
                    .scheduler
                    .handle_failure(job, &guard, &failure, now)
                    .await?;
                if self.count_superseded(job, applied.result, report) {
                    return Ok(());
                }
                match applied.decision {
                    RetryDecision::Retry {
                        delay, not_before, ..
                    } => {
                        report.retried += 1;
                        self.record_audit(
                            record(AuditEvent::Retry)
                                .with_error(&failure.code, &failure.message)
                                .with_detail(json!({
                                    "delay_secs": delay.as_secs(),
                                    "not_before": not_before,
                                })),
                        );
                    }
                    RetryDecision::Fail { non_retryable, .. } => {
                        report.failed += 1;
                        self.record_audit(
                            record(AuditEvent::Error)
                                .with_error(&failure.code, &failure.message)
                                .with_detail(json!({ "non_retryable": non_retryable })),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn count_superseded(&self, job: &Job, written: FinalizeResult, report: &mut TickReport) -> bool {
        if written.is_applied() {
            return false;
        }
        tracing::warn!(
            job_id = job.id,
            result = ?written,
            "Outcome not recorded, job was taken over",
        );
        report.superseded += 1;
        true
    }

    async fn release(&self, jobs: impl Iterator<Item = Job>) -> Result<usize, WorkerError> {
        let mut released = 0;
        for job in jobs {
            if JobRepo::release_claim(&self.pool, job.id, self.owner(), self.clock.now()).await? {
                tracing::info!(job_id = job.id, "Released unstarted claim");
                released += 1;
            }
        }
        Ok(released)
    }

    fn audit_reap(&self, reaped: &ReapedJob) {
        let job = &reaped.job;
        let mut record = AuditRecord::new(AuditEvent::Reap, job.id, &job.job_type, self.clock.now())
            .with_entity(job.entity_ref())
            .with_attempt(reaped.applied.decision.attempt_count())
            .with_error(codes::STUCK_JOB, "no heartbeat within stuck threshold")
            .with_detail(json!({
                "previous_owner": job.owner,
                "last_heartbeat": job.heartbeat_at,
                "requeued": reaped.applied.decision.is_retry(),
            }));
        record.owner = Some(self.owner().to_string());
        self.record_audit(record);
    }

    /// Sink failures never fail the job.
    fn record_audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(&record) {
            tracing::warn!(
                job_id = record.job_id,
                event = %record.event,
                error = %e,
                "Failed to write audit record",
            );
        }
    }
}

fn outcome_trace(outcome: &Outcome) -> serde_json::Value {
    match outcome {
        Outcome::Done { result } => json!({ "outcome": "done", "result": result }),
        Outcome::Failed(failure) => json!({ "outcome": "failed", "failure": failure }),
        Outcome::Cancelled { reason } => json!({ "outcome": "cancelled", "reason": reason }),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_merge_and_idle() {
        let mut total = TickReport::default();
        assert!(total.is_idle());

        let tick = TickReport {
            claimed: 2,
            succeeded: 1,
            retried: 1,
            ..TickReport::default()
        };
        total.merge(&tick);
        total.merge(&tick);
        assert_eq!(total.claimed, 4);
        assert_eq!(total.retried, 2);
        assert!(!total.is_idle());
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "non-string panic payload");
    }
}
