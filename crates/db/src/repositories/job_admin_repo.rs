//! Administrative bulk operations on the `jobs` table.
//!
//! Matching rows are selected first and then changed with conditional
//! statements that re-check the status, so a job that changes state between
//! the two steps is skipped rather than clobbered. Each operation runs in
//! one transaction, so a failure part-way leaves the table untouched.

use std::time::Duration;

use medialib_core::job_status::{JobStatus, ACTIVE_STATUSES};
use medialib_core::types::{from_millis, to_millis, DbId, Timestamp};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::models::admin::{ForceCancelReport, JobFilter, PruneReport, PruneRequest};
use crate::models::job::stages;

/// Ids per bulk statement; keeps well under SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;

/// Code stored on jobs moved to `cancelled` by force-cancel.
pub const FORCE_CANCELLED_CODE: &str = "force_cancelled";

/// A matching row as seen by the selection step.
#[derive(Debug, sqlx::FromRow)]
struct MatchedJob {
    id: DbId,
    status: String,
    heartbeat_at: Option<i64>,
    cancel_requested: bool,
}

impl MatchedJob {
    fn is_running(&self) -> bool {
        self.status == JobStatus::Running.as_str()
    }
}

/// Append the filter's predicates to a query that already has a `WHERE`.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter, statuses: &[JobStatus]) {
    let has_prefix = filter.type_prefix.is_some();
    if has_prefix || !filter.types.is_empty() {
        qb.push(" AND (");
        if let Some(prefix) = &filter.type_prefix {
            qb.push("substr(job_type, 1, ")
                .push_bind(prefix.chars().count() as i64)
                .push(") = ")
                .push_bind(prefix.clone());
        }
        if !filter.types.is_empty() {
            if has_prefix {
                qb.push(" OR ");
            }
            qb.push("job_type IN (");
            let mut separated = qb.separated(", ");
            for job_type in &filter.types {
                separated.push_bind(job_type.clone());
            }
            separated.push_unseparated(")");
        }
        qb.push(")");
    }

    if !statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }

    if let Some(scope) = &filter.scope {
        qb.push(" AND substr(dedup_key, 1, ")
            .push_bind(scope.chars().count() as i64)
            .push(") = ")
            .push_bind(scope.clone());
    }
}

fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[DbId]) {
    qb.push(" AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

/// Administrative queries: prune and force-cancel.
pub struct JobAdminRepo;

impl JobAdminRepo {
    async fn select_matching(
        conn: &mut SqliteConnection,
        filter: &JobFilter,
        statuses: &[JobStatus],
    ) -> Result<Vec<MatchedJob>, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, status, heartbeat_at, cancel_requested FROM jobs WHERE 1 = 1",
        );
        push_filter(&mut qb, filter, statuses);
        qb.push(" ORDER BY id ASC");
        qb.build_query_as::<MatchedJob>().fetch_all(conn).await
    }

    /// Delete jobs matching the request's filter.
    ///
    /// Running jobs are protected: without `include_running` they are only
    /// counted in `blocked_running`; with `include_running` but without
    /// `force_running` they are flagged for cancellation (`updated`); only
    /// `force_running` deletes them.
    pub async fn prune(
        pool: &SqlitePool,
        request: &PruneRequest,
        now: Timestamp,
    ) -> Result<PruneReport, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let matched =
            Self::select_matching(&mut tx, &request.filter, &request.filter.statuses).await?;
        let (running, idle): (Vec<&MatchedJob>, Vec<&MatchedJob>) =
            matched.iter().partition(|job| job.is_running());
        let idle_ids: Vec<DbId> = idle.iter().map(|job| job.id).collect();
        let running_ids: Vec<DbId> = running.iter().map(|job| job.id).collect();

        let mut report = PruneReport {
            matched: matched.len() as u64,
            dry_run: request.dry_run,
            ..PruneReport::default()
        };

        if request.dry_run {
            report.deleted = idle_ids.len() as u64;
            match (request.include_running, request.force_running) {
                (false, _) => report.blocked_running = running_ids.len() as u64,
                (true, false) => report.updated = running_ids.len() as u64,
                (true, true) => report.deleted += running_ids.len() as u64,
            }
            return Ok(report);
        }

        for chunk in idle_ids.chunks(ID_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM jobs WHERE status <> 'running'");
            push_ids(&mut qb, chunk);
            report.deleted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        if !request.include_running {
            report.blocked_running = running_ids.len() as u64;
        } else if request.force_running {
            for chunk in running_ids.chunks(ID_CHUNK) {
                let mut qb =
                    QueryBuilder::<Sqlite>::new("DELETE FROM jobs WHERE status = 'running'");
                push_ids(&mut qb, chunk);
                report.deleted += qb.build().execute(&mut *tx).await?.rows_affected();
            }
        } else {
            for chunk in running_ids.chunks(ID_CHUNK) {
                let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET cancel_requested = 1, updated_at = ");
                qb.push_bind(to_millis(now))
                    .push(" WHERE status = 'running'");
                push_ids(&mut qb, chunk);
                report.updated += qb.build().execute(&mut *tx).await?.rows_affected();
            }
        }

        tx.commit().await?;

        tracing::info!(
            matched = report.matched,
            deleted = report.deleted,
            updated = report.updated,
            blocked_running = report.blocked_running,
            "Pruned jobs",
        );
        Ok(report)
    }

    /// Request cancellation of matching non-terminal jobs and move running
    /// jobs whose heartbeat is older than `stale_threshold` straight to
    /// `cancelled`.
    pub async fn force_cancel(
        pool: &SqlitePool,
        filter: &JobFilter,
        stale_threshold: Duration,
        dry_run: bool,
        now: Timestamp,
    ) -> Result<ForceCancelReport, sqlx::Error> {
        let statuses: Vec<JobStatus> = if filter.statuses.is_empty() {
            ACTIVE_STATUSES.to_vec()
        } else {
            filter
                .statuses
                .iter()
                .copied()
                .filter(|status| status.is_active())
                .collect()
        };
        if statuses.is_empty() {
            return Ok(ForceCancelReport {
                dry_run,
                ..ForceCancelReport::default()
            });
        }

        let cutoff = chrono::Duration::from_std(stale_threshold)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let cutoff_ms = to_millis(cutoff);
        let now_ms = to_millis(now);

        let mut tx = pool.begin().await?;
        let matched = Self::select_matching(&mut tx, filter, &statuses).await?;
        let unflagged: Vec<DbId> = matched
            .iter()
            .filter(|job| !job.cancel_requested)
            .map(|job| job.id)
            .collect();
        let stale: Vec<DbId> = matched
            .iter()
            .filter(|job| job.is_running())
            .filter(|job| job.heartbeat_at.map_or(true, |hb| from_millis(hb) < cutoff))
            .map(|job| job.id)
            .collect();

        let mut report = ForceCancelReport {
            matched: matched.len() as u64,
            dry_run,
            ..ForceCancelReport::default()
        };

        if dry_run {
            report.flagged = unflagged.len() as u64;
            report.force_cancelled = stale.len() as u64;
            report.force_cancelled_ids = stale;
            return Ok(report);
        }

        for chunk in unflagged.chunks(ID_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET cancel_requested = 1, updated_at = ");
            qb.push_bind(now_ms).push(
                " WHERE cancel_requested = 0 AND status IN ('pending', 'queued', 'running')",
            );
            push_ids(&mut qb, chunk);
            report.flagged += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        let message = format!(
            "force-cancelled: no heartbeat for over {}s",
            stale_threshold.as_secs()
        );
        for id in stale {
            let result = sqlx::query(
                "UPDATE jobs \
                 SET status = 'cancelled', cancel_requested = 1, cancelled_at = ?, \
                     last_error_code = ?, last_error_message = ?, stage = ?, updated_at = ? \
                 WHERE id = ? AND status = 'running' \
                   AND (heartbeat_at IS NULL OR heartbeat_at < ?)",
            )
            .bind(now_ms)
            .bind(FORCE_CANCELLED_CODE)
            .bind(&message)
            .bind(stages::FORCE_CANCELLED)
            .bind(now_ms)
            .bind(id)
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                report.force_cancelled += 1;
                report.force_cancelled_ids.push(id);
            }
        }

        tx.commit().await?;

        tracing::info!(
            matched = report.matched,
            flagged = report.flagged,
            force_cancelled = report.force_cancelled,
            "Force-cancelled jobs",
        );
        Ok(report)
    }
}
