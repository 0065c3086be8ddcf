//! Background liveness updates while a handler runs.

use std::sync::Arc;
use std::time::Duration;

use medialib_core::clock::Clock;
use medialib_core::types::DbId;
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lease::{LeaseError, WorkerLease};

/// What the heartbeat task observed before it was stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub beats: u32,
    /// The job stopped being ours (reaped or force-cancelled).
    pub job_lost: bool,
    /// The worker lease was replaced by another process.
    pub lease_lost: bool,
}

/// Refreshes the worker lease and the running job's heartbeat on a fixed
/// interval until stopped.
///
/// Claims still waiting their turn in the same batch are refreshed too, so a
/// long first job does not make them look abandoned.
pub struct HeartbeatTask {
    token: CancellationToken,
    handle: JoinHandle<HeartbeatSummary>,
}

impl HeartbeatTask {
    pub fn spawn(
        lease: Arc<WorkerLease>,
        pool: DbPool,
        clock: Arc<dyn Clock>,
        job_id: DbId,
        mut waiting: Vec<DbId>,
        owner: String,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut summary = HeartbeatSummary::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the claim already set
            // the heartbeat.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                summary.beats += 1;

                match lease.renew() {
                    Ok(_) => {}
                    Err(LeaseError::Lost { .. }) => {
                        tracing::error!(job_id, owner = %owner, "Worker lease lost during job");
                        summary.lease_lost = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Lease renewal failed");
                    }
                }

                let now = clock.now();
                let mut kept = Vec::with_capacity(waiting.len());
                for waiting_id in waiting.drain(..) {
                    match JobRepo::heartbeat(&pool, waiting_id, &owner, now).await {
                        Ok(true) => kept.push(waiting_id),
                        Ok(false) => {
                            tracing::debug!(job_id = waiting_id, "Waiting claim no longer ours");
                        }
                        Err(e) => {
                            tracing::warn!(job_id = waiting_id, error = %e, "Claim heartbeat failed");
                            kept.push(waiting_id);
                        }
                    }
                }
                waiting = kept;

                if summary.job_lost {
                    continue;
                }
                match JobRepo::heartbeat(&pool, job_id, &owner, now).await {
                    Ok(true) => {
                        tracing::trace!(job_id, beats = summary.beats, "Job heartbeat");
                    }
                    Ok(false) => {
                        tracing::warn!(
                            job_id,
                            owner = %owner,
                            "Job no longer owned by this worker, heartbeat stopped",
                        );
                        summary.job_lost = true;
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Job heartbeat failed");
                    }
                }
            }

            summary
        });

        Self { token, handle }
    }

    /// Stop the task and collect its summary.
    pub async fn stop(self) -> HeartbeatSummary {
        self.token.cancel();
        match self.handle.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "Heartbeat task failed");
                HeartbeatSummary::default()
            }
        }
    }
}
