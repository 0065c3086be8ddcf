//! Heartbeat task against a real interval.

mod common;

use std::time::Duration;

use common::{caption, secs, t0, Harness};
use medialib_core::clock::Clock;
use medialib_db::repositories::JobRepo;
use medialib_worker::heartbeat::HeartbeatTask;
use medialib_worker::lease::LeaseBackend;

const CAPTION: &[&str] = &["caption"];
const INTERVAL: Duration = Duration::from_millis(20);

#[tokio::test]
async fn beats_refresh_job_and_lease() {
    let h = Harness::new().await;
    let id = h.enqueue(&caption(7)).await;
    let lease = h.lease("caption", 1);
    let owner = lease.owner_id();
    JobRepo::claim_next(&h.pool, CAPTION, 1, &owner, h.clock.now())
        .await
        .unwrap();

    h.advance(secs(10));
    let task = HeartbeatTask::spawn(
        lease.clone(),
        h.pool.clone(),
        h.clock(),
        id,
        Vec::new(),
        owner,
        INTERVAL,
    );
    tokio::time::sleep(INTERVAL * 5).await;
    let summary = task.stop().await;

    assert!(summary.beats >= 1);
    assert!(!summary.job_lost);
    assert!(!summary.lease_lost);
    assert_eq!(h.reload(id).await.heartbeat_at, Some(t0() + secs(10)));
    assert_eq!(lease.record().heartbeat_at, t0() + secs(10));
}

#[tokio::test]
async fn reclaimed_job_is_reported_lost() {
    let h = Harness::new().await;
    let id = h.enqueue(&caption(7)).await;
    let lease = h.lease("caption", 1);
    let owner = lease.owner_id();
    JobRepo::claim_next(&h.pool, CAPTION, 1, &owner, h.clock.now())
        .await
        .unwrap();
    JobRepo::release_claim(&h.pool, id, &owner, h.clock.now())
        .await
        .unwrap();

    let task = HeartbeatTask::spawn(
        lease,
        h.pool.clone(),
        h.clock(),
        id,
        Vec::new(),
        owner,
        INTERVAL,
    );
    tokio::time::sleep(INTERVAL * 5).await;
    let summary = task.stop().await;

    assert!(summary.job_lost);
    assert!(!summary.lease_lost);
}

#[tokio::test]
async fn replaced_lease_stops_the_task() {
    let h = Harness::new().await;
    let id = h.enqueue(&caption(7)).await;
    let lease = h.lease("caption", 1);
    let owner = lease.owner_id();
    JobRepo::claim_next(&h.pool, CAPTION, 1, &owner, h.clock.now())
        .await
        .unwrap();

    h.leases.remove("caption.lease.json").unwrap();

    let task = HeartbeatTask::spawn(
        lease,
        h.pool.clone(),
        h.clock(),
        id,
        Vec::new(),
        owner,
        INTERVAL,
    );
    tokio::time::sleep(INTERVAL * 5).await;
    let summary = task.stop().await;

    assert!(summary.lease_lost);
    assert_eq!(summary.beats, 1);
}

#[tokio::test]
async fn waiting_claims_in_the_batch_stay_fresh() {
    let h = Harness::new().await;
    let running = h.enqueue(&caption(1)).await;
    let waiting = h.enqueue(&caption(2)).await;
    let lease = h.lease("caption", 1);
    let owner = lease.owner_id();
    JobRepo::claim_next(&h.pool, CAPTION, 2, &owner, h.clock.now())
        .await
        .unwrap();

    h.advance(secs(10));
    let task = HeartbeatTask::spawn(
        lease,
        h.pool.clone(),
        h.clock(),
        running,
        vec![waiting],
        owner,
        INTERVAL,
    );
    tokio::time::sleep(INTERVAL * 5).await;
    task.stop().await;

    assert_eq!(h.reload(waiting).await.heartbeat_at, Some(t0() + secs(10)));
}
