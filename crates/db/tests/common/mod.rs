#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use medialib_core::types::Timestamp;
use medialib_db::models::job::{EnqueueJob, Job};
use medialib_db::repositories::JobRepo;
use medialib_db::DbPool;
use serde_json::json;
use tempfile::TempDir;

/// A migrated SQLite file in a temporary directory.
///
/// Extra pools opened with [`TestDb::open_pool`] share the file the way
/// separate worker processes would.
pub struct TestDb {
    pub pool: DbPool,
    pub url: String,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = medialib_db::create_pool(&url).await.expect("create pool");
        medialib_db::run_migrations(&pool).await.expect("migrate");
        Self {
            pool,
            url,
            _dir: dir,
        }
    }

    pub async fn open_pool(&self) -> DbPool {
        medialib_db::create_pool(&self.url).await.expect("open pool")
    }
}

pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap()
}

pub fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

pub fn caption(media_id: i64) -> EnqueueJob {
    EnqueueJob::new("caption", json!({ "media_id": media_id }))
        .with_dedup_key(format!("media:{media_id}"))
}

pub async fn reload(pool: &DbPool, id: i64) -> Job {
    JobRepo::find_by_id(pool, id)
        .await
        .unwrap()
        .expect("job exists")
}
