#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use medialib_core::clock::{Clock, ManualClock};
use medialib_core::retry::RetryPolicy;
use medialib_core::types::Timestamp;
use medialib_db::models::job::{EnqueueJob, Job};
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;
use medialib_events::MemoryAuditSink;
use medialib_worker::lease::{LeaseAcquisition, LeaseSpec, MemoryLeaseBackend, WorkerLease};
use medialib_worker::{HandlerRegistry, JobContext, JobHandler, LoopSettings, Outcome, WorkerLoop};
use serde_json::json;
use tempfile::TempDir;

pub const LIVENESS: Duration = Duration::from_secs(30);

pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn caption(media_id: i64) -> EnqueueJob {
    EnqueueJob::new("caption", json!({ "media_id": media_id }))
        .with_dedup_key(format!("media:{media_id}"))
}

pub fn settings() -> LoopSettings {
    LoopSettings {
        job_types: vec!["caption".to_string()],
        batch_size: 1,
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_secs(5),
        stuck_threshold: Duration::from_secs(300),
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
        },
        run_once: false,
    }
}

/// A migrated database, a manual clock, and in-memory lease and audit
/// stores shared by every worker a test builds.
pub struct Harness {
    pub pool: DbPool,
    pub clock: Arc<ManualClock>,
    pub leases: Arc<MemoryLeaseBackend>,
    pub audit: Arc<MemoryAuditSink>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = medialib_db::create_pool(&url).await.expect("create pool");
        medialib_db::run_migrations(&pool).await.expect("migrate");
        Self {
            pool,
            clock: Arc::new(ManualClock::new(t0())),
            leases: Arc::new(MemoryLeaseBackend::new()),
            audit: Arc::new(MemoryAuditSink::new()),
            _dir: dir,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    pub fn try_lease(&self, worker_type: &str, pid: u32) -> LeaseAcquisition {
        let spec = LeaseSpec {
            worker_type: worker_type.to_string(),
            liveness: LIVENESS,
            command_fingerprint: "test".to_string(),
            host: "testhost".to_string(),
            pid,
        };
        WorkerLease::acquire(self.leases.clone(), self.clock(), spec).expect("lease backend")
    }

    pub fn lease(&self, worker_type: &str, pid: u32) -> Arc<WorkerLease> {
        match self.try_lease(worker_type, pid) {
            LeaseAcquisition::Acquired(lease) => Arc::new(lease),
            LeaseAcquisition::Busy(holder) => panic!("lease busy: {holder:?}"),
        }
    }

    pub fn worker(
        &self,
        lease: Arc<WorkerLease>,
        registry: HandlerRegistry,
        settings: LoopSettings,
    ) -> WorkerLoop {
        WorkerLoop::new(
            self.pool.clone(),
            lease,
            self.clock(),
            registry,
            self.audit.clone(),
            settings,
        )
    }

    pub async fn enqueue(&self, input: &EnqueueJob) -> i64 {
        medialib_worker::producer::enqueue(&self.pool, self.audit.as_ref(), input, self.clock.now())
            .await
            .expect("enqueue")
            .id
    }

    pub async fn reload(&self, id: i64) -> Job {
        JobRepo::find_by_id(&self.pool, id)
            .await
            .unwrap()
            .expect("job exists")
    }
}

/// Returns queued outcomes in order, then `Done` with no result.
#[derive(Default)]
pub struct ScriptedHandler {
    outcomes: Mutex<VecDeque<Outcome>>,
    calls: AtomicUsize,
    attempts: Mutex<Vec<i32>>,
}

impl ScriptedHandler {
    pub fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `ctx.attempt()` as seen by each call.
    pub fn attempts(&self) -> Vec<i32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn execute(&self, ctx: &JobContext, _job: &Job) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(ctx.attempt());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Done { result: None })
    }
}

pub fn registry(handler: Arc<dyn JobHandler>) -> HandlerRegistry {
    HandlerRegistry::new().register("caption", handler)
}
