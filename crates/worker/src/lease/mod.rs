//! Single-instance lease per worker type.
//!
//! A lease is a small JSON document named after the worker type. It is
//! created exclusively, refreshed on a timer while the worker runs, and
//! removed when the [`WorkerLease`] is dropped. A lease whose heartbeat is
//! older than the liveness window belongs to a dead process and may be
//! taken over; the old document is renamed aside rather than overwritten so
//! operators can inspect it.

mod fs;
mod memory;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use medialib_core::clock::Clock;
use medialib_core::types::{to_millis, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use fs::FsLeaseBackend;
pub use memory::MemoryLeaseBackend;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lease serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The lease document was removed or replaced by another process.
    #[error("lease for worker type {worker_type} is no longer held")]
    Lost { worker_type: String },

    #[error("lease backend lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Storage backend
// ---------------------------------------------------------------------------

/// Storage for lease documents, keyed by name.
pub trait LeaseBackend: Send + Sync + fmt::Debug {
    /// Store `bytes` under `name` only if nothing is stored there yet.
    ///
    /// Returns `false` when the name is taken. Readers never observe a
    /// partially written document.
    fn create_new(&self, name: &str, bytes: &[u8]) -> Result<bool, LeaseError>;

    /// Read the document stored under `name`, if any.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, LeaseError>;

    /// Atomically replace the document stored under `name`.
    fn replace(&self, name: &str, bytes: &[u8]) -> Result<(), LeaseError>;

    /// Move the document aside to `name + suffix`. Returns `false` when
    /// there was nothing to move.
    fn quarantine(&self, name: &str, suffix: &str) -> Result<bool, LeaseError>;

    /// Move the document stored under `from` back to `to`, unless `to` has
    /// been taken in the meantime. Returns whether it was moved.
    fn restore(&self, from: &str, to: &str) -> Result<bool, LeaseError>;

    /// Delete the document. Returns `false` when there was nothing to delete.
    fn remove(&self, name: &str) -> Result<bool, LeaseError>;
}

// ---------------------------------------------------------------------------
// Lease document
// ---------------------------------------------------------------------------

/// Lease document as stored and as read by external monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub worker_type: String,
    pub pid: u32,
    pub host: String,
    pub started_at: Timestamp,
    pub heartbeat_at: Timestamp,
    pub command_fingerprint: String,
    /// Identifies this acquisition; a process only refreshes or deletes a
    /// lease carrying its own token.
    pub token: Uuid,
}

impl LeaseRecord {
    /// Whether the last heartbeat is older than `liveness` at `now`.
    pub fn is_stale(&self, now: Timestamp, liveness: Duration) -> bool {
        let age = now.signed_duration_since(self.heartbeat_at);
        age.to_std().map(|age| age > liveness).unwrap_or(false)
    }
}

/// What a worker asks for when it starts.
#[derive(Debug, Clone)]
pub struct LeaseSpec {
    pub worker_type: String,
    pub liveness: Duration,
    pub command_fingerprint: String,
    pub host: String,
    pub pid: u32,
}

impl LeaseSpec {
    /// Spec for the current process on the current host.
    pub fn for_current_process(
        worker_type: impl Into<String>,
        liveness: Duration,
        command_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            worker_type: worker_type.into(),
            liveness,
            command_fingerprint: command_fingerprint.into(),
            host: current_host(),
            pid: std::process::id(),
        }
    }
}

/// Host name from `/etc/hostname` or `$HOSTNAME`.
pub fn current_host() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn lease_name(worker_type: &str) -> String {
    format!("{worker_type}.lease.json")
}

// ---------------------------------------------------------------------------
// WorkerLease
// ---------------------------------------------------------------------------

/// Result of [`WorkerLease::acquire`].
#[derive(Debug)]
pub enum LeaseAcquisition {
    Acquired(WorkerLease),
    /// Another live process holds the lease. `None` when the holder's
    /// document could not be read after a lost takeover race.
    Busy(Option<LeaseRecord>),
}

/// A held lease. Released when dropped.
pub struct WorkerLease {
    backend: Arc<dyn LeaseBackend>,
    clock: Arc<dyn Clock>,
    name: String,
    liveness: Duration,
    record: Mutex<LeaseRecord>,
    released: Mutex<bool>,
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("name", &self.name)
            .field("liveness", &self.liveness)
            .field("record", &self.record)
            .finish()
    }
}

impl WorkerLease {
    /// Acquire the lease for `spec.worker_type`.
    ///
    /// 1. Exclusive create. Success means the lease is ours.
    /// 2. Otherwise read the existing document. A live one means `Busy`.
    /// 3. A stale or unreadable one is renamed aside. If what was moved is
    ///    not the document we judged, a concurrent takeover won; it is put
    ///    back and the result is `Busy`.
    /// 4. The exclusive create is retried once. Losing that race is also
    ///    `Busy`.
    pub fn acquire(
        backend: Arc<dyn LeaseBackend>,
        clock: Arc<dyn Clock>,
        spec: LeaseSpec,
    ) -> Result<LeaseAcquisition, LeaseError> {
        let name = lease_name(&spec.worker_type);
        let now = clock.now();
        let record = LeaseRecord {
            worker_type: spec.worker_type.clone(),
            pid: spec.pid,
            host: spec.host.clone(),
            started_at: now,
            heartbeat_at: now,
            command_fingerprint: spec.command_fingerprint.clone(),
            token: Uuid::new_v4(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        if backend.create_new(&name, &bytes)? {
            return Ok(Self::acquired(backend, clock, name, spec.liveness, record));
        }

        if let Some(existing) = backend.read(&name)? {
            let kind = match serde_json::from_slice::<LeaseRecord>(&existing) {
                Ok(holder) if !holder.is_stale(now, spec.liveness) => {
                    tracing::info!(
                        worker_type = %spec.worker_type,
                        holder_pid = holder.pid,
                        holder_host = %holder.host,
                        "Another instance is active",
                    );
                    return Ok(LeaseAcquisition::Busy(Some(holder)));
                }
                Ok(holder) => {
                    tracing::warn!(
                        worker_type = %spec.worker_type,
                        holder_pid = holder.pid,
                        heartbeat_at = %holder.heartbeat_at,
                        "Quarantining stale lease",
                    );
                    "stale"
                }
                Err(e) => {
                    tracing::warn!(
                        worker_type = %spec.worker_type,
                        error = %e,
                        "Quarantining unreadable lease",
                    );
                    "corrupt"
                }
            };

            let suffix = format!(".{kind}-{}-{}", to_millis(now), Uuid::new_v4().simple());
            if backend.quarantine(&name, &suffix)? {
                let moved_aside = format!("{name}{suffix}");
                let moved = backend.read(&moved_aside)?;
                // Another process may have replaced the document between our
                // read and the rename; that one is live and goes back.
                if moved.as_deref() != Some(existing.as_slice()) {
                    let restored = backend.restore(&moved_aside, &name)?;
                    let holder = moved.and_then(|bytes| serde_json::from_slice(&bytes).ok());
                    tracing::info!(
                        worker_type = %spec.worker_type,
                        restored,
                        "Lease changed during takeover, backing off",
                    );
                    return Ok(LeaseAcquisition::Busy(holder));
                }
            }
        }

        if backend.create_new(&name, &bytes)? {
            return Ok(Self::acquired(backend, clock, name, spec.liveness, record));
        }

        let holder = backend
            .read(&name)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        tracing::info!(worker_type = %spec.worker_type, "Lost lease takeover race");
        Ok(LeaseAcquisition::Busy(holder))
    }

    fn acquired(
        backend: Arc<dyn LeaseBackend>,
        clock: Arc<dyn Clock>,
        name: String,
        liveness: Duration,
        record: LeaseRecord,
    ) -> LeaseAcquisition {
        tracing::info!(
            worker_type = %record.worker_type,
            pid = record.pid,
            token = %record.token,
            "Lease acquired",
        );
        LeaseAcquisition::Acquired(WorkerLease {
            backend,
            clock,
            name,
            liveness,
            record: Mutex::new(record),
            released: Mutex::new(false),
        })
    }

    /// Snapshot of the lease document as last written by this process.
    pub fn record(&self) -> LeaseRecord {
        match self.record.lock() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn worker_type(&self) -> String {
        self.record().worker_type
    }

    /// Identity stamped on claimed jobs: `<worker_type>@<host>:<pid>/<token8>`.
    pub fn owner_id(&self) -> String {
        let record = self.record();
        let token = record.token.simple().to_string();
        format!(
            "{}@{}:{}/{}",
            record.worker_type,
            record.host,
            record.pid,
            &token[..8]
        )
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    /// Rewrite the heartbeat, provided the stored document is still ours.
    pub fn renew(&self) -> Result<Timestamp, LeaseError> {
        let now = self.clock.now();
        let mut record = self.record.lock().map_err(|_| LeaseError::Poisoned)?;
        if !self.stored_token_matches(record.token)? {
            return Err(LeaseError::Lost {
                worker_type: record.worker_type.clone(),
            });
        }
        let mut next = record.clone();
        next.heartbeat_at = now;
        self.backend
            .replace(&self.name, &serde_json::to_vec_pretty(&next)?)?;
        *record = next;
        Ok(now)
    }

    /// Whether this process's own last heartbeat is older than the window.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.record().is_stale(now, self.liveness)
    }

    /// Remove the lease document if it is still ours. Idempotent.
    pub fn release(&self) -> Result<bool, LeaseError> {
        let mut released = self.released.lock().map_err(|_| LeaseError::Poisoned)?;
        if *released {
            return Ok(false);
        }
        let token = self.record().token;
        let removed = if self.stored_token_matches(token)? {
            self.backend.remove(&self.name)?
        } else {
            false
        };
        *released = true;
        tracing::info!(lease = %self.name, removed, "Lease released");
        Ok(removed)
    }

    fn stored_token_matches(&self, token: Uuid) -> Result<bool, LeaseError> {
        let Some(bytes) = self.backend.read(&self.name)? else {
            return Ok(false);
        };
        Ok(serde_json::from_slice::<LeaseRecord>(&bytes)
            .map(|stored| stored.token == token)
            .unwrap_or(false))
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(lease = %self.name, error = %e, "Failed to release lease on drop");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use medialib_core::clock::ManualClock;

    const LIVENESS: Duration = Duration::from_secs(30);

    fn setup() -> (Arc<MemoryLeaseBackend>, Arc<ManualClock>) {
        let start = chrono::Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();
        (
            Arc::new(MemoryLeaseBackend::new()),
            Arc::new(ManualClock::new(start)),
        )
    }

    fn spec(pid: u32) -> LeaseSpec {
        LeaseSpec {
            worker_type: "caption".into(),
            liveness: LIVENESS,
            command_fingerprint: "abc123".into(),
            host: "host-a".into(),
            pid,
        }
    }

    fn acquire(
        backend: &Arc<MemoryLeaseBackend>,
        clock: &Arc<ManualClock>,
        pid: u32,
    ) -> LeaseAcquisition {
        WorkerLease::acquire(backend.clone(), clock.clone(), spec(pid)).unwrap()
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    #[test]
    fn live_lease_refuses_second_instance() {
        let (backend, clock) = setup();
        let first = acquire(&backend, &clock, 100);
        assert_matches!(first, LeaseAcquisition::Acquired(_));

        clock.advance(chrono::Duration::seconds(10));
        let second = acquire(&backend, &clock, 200);
        assert_matches!(second, LeaseAcquisition::Busy(Some(holder)) if holder.pid == 100);
        assert_eq!(backend.names(), vec!["caption.lease.json".to_string()]);
    }

    #[test]
    fn stale_lease_is_quarantined_and_taken_over() {
        let (backend, clock) = setup();
        let LeaseAcquisition::Acquired(first) = acquire(&backend, &clock, 100) else {
            panic!("first acquire should succeed");
        };
        let old_token = first.record().token;
        // Simulate a crash: the lease is never released.
        std::mem::forget(first);

        clock.advance(chrono::Duration::seconds(31));
        let LeaseAcquisition::Acquired(second) = acquire(&backend, &clock, 200) else {
            panic!("stale lease should be taken over");
        };
        assert_ne!(second.record().token, old_token);

        let names = backend.names();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.starts_with("caption.lease.json.stale-")));
    }

    #[test]
    fn corrupt_lease_is_quarantined() {
        let (backend, clock) = setup();
        backend.insert_raw("caption.lease.json", b"{not json");

        assert_matches!(acquire(&backend, &clock, 100), LeaseAcquisition::Acquired(_));
        assert!(backend
            .names()
            .iter()
            .any(|n| n.starts_with("caption.lease.json.corrupt-")));
    }

    /// Serves one outdated read, as seen by a process that read the lease
    /// just before someone else took it over.
    #[derive(Debug)]
    struct OutdatedFirstRead {
        inner: Arc<MemoryLeaseBackend>,
        outdated: Mutex<Option<Vec<u8>>>,
    }

    impl LeaseBackend for OutdatedFirstRead {
        fn create_new(&self, name: &str, bytes: &[u8]) -> Result<bool, LeaseError> {
            self.inner.create_new(name, bytes)
        }

        fn read(&self, name: &str) -> Result<Option<Vec<u8>>, LeaseError> {
            if let Some(bytes) = self.outdated.lock().unwrap().take() {
                return Ok(Some(bytes));
            }
            self.inner.read(name)
        }

        fn replace(&self, name: &str, bytes: &[u8]) -> Result<(), LeaseError> {
            self.inner.replace(name, bytes)
        }

        fn quarantine(&self, name: &str, suffix: &str) -> Result<bool, LeaseError> {
            self.inner.quarantine(name, suffix)
        }

        fn restore(&self, from: &str, to: &str) -> Result<bool, LeaseError> {
            self.inner.restore(from, to)
        }

        fn remove(&self, name: &str) -> Result<bool, LeaseError> {
            self.inner.remove(name)
        }
    }

    #[test]
    fn concurrent_takeover_of_same_stale_lease_admits_one() {
        let (backend, clock) = setup();
        let LeaseAcquisition::Acquired(crashed) = acquire(&backend, &clock, 100) else {
            panic!("acquire");
        };
        std::mem::forget(crashed);
        let stale = backend.read("caption.lease.json").unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let LeaseAcquisition::Acquired(winner) = acquire(&backend, &clock, 200) else {
            panic!("stale lease should be taken over");
        };

        // The loser judged the crashed holder's document, not the winner's.
        let loser_view = Arc::new(OutdatedFirstRead {
            inner: backend.clone(),
            outdated: Mutex::new(stale),
        });
        let loser = WorkerLease::acquire(loser_view, clock.clone(), spec(300)).unwrap();
        assert_matches!(loser, LeaseAcquisition::Busy(Some(holder)) if holder.pid == 200);

        assert!(winner.renew().is_ok());
        let quarantined = backend
            .names()
            .into_iter()
            .filter(|n| n.contains(".stale-"))
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn quarantine_names_do_not_collide() {
        let (backend, clock) = setup();
        backend.insert_raw("caption.lease.json", b"{not json");
        let LeaseAcquisition::Acquired(first) = acquire(&backend, &clock, 100) else {
            panic!("acquire");
        };
        drop(first);

        // Same instant, second corrupt document.
        backend.insert_raw("caption.lease.json", b"{still not json");
        assert_matches!(acquire(&backend, &clock, 200), LeaseAcquisition::Acquired(_));

        let corrupt: Vec<String> = backend
            .names()
            .into_iter()
            .filter(|n| n.contains(".corrupt-"))
            .collect();
        assert_eq!(corrupt.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Renew / release
    // -----------------------------------------------------------------------

    #[test]
    fn renew_refreshes_heartbeat() {
        let (backend, clock) = setup();
        let LeaseAcquisition::Acquired(lease) = acquire(&backend, &clock, 100) else {
            panic!("acquire");
        };
        clock.advance(chrono::Duration::seconds(25));
        let renewed_at = lease.renew().unwrap();
        assert_eq!(lease.record().heartbeat_at, renewed_at);

        clock.advance(chrono::Duration::seconds(25));
        assert!(!lease.is_stale(clock.now()));
        assert_matches!(acquire(&backend, &clock, 200), LeaseAcquisition::Busy(_));
    }

    #[test]
    fn renew_after_takeover_reports_lost() {
        let (backend, clock) = setup();
        let LeaseAcquisition::Acquired(first) = acquire(&backend, &clock, 100) else {
            panic!("acquire");
        };
        clock.advance(chrono::Duration::seconds(60));
        assert!(first.is_stale(clock.now()));
        let LeaseAcquisition::Acquired(_second) = acquire(&backend, &clock, 200) else {
            panic!("takeover");
        };

        assert_matches!(first.renew(), Err(LeaseError::Lost { .. }));
        // Dropping the old handle must not delete the new holder's lease.
        drop(first);
        assert!(backend.read("caption.lease.json").unwrap().is_some());
    }

    #[test]
    fn drop_releases_lease() {
        let (backend, clock) = setup();
        {
            let acquisition = acquire(&backend, &clock, 100);
            assert_matches!(acquisition, LeaseAcquisition::Acquired(_));
        }
        assert!(backend.names().is_empty());
        assert_matches!(acquire(&backend, &clock, 200), LeaseAcquisition::Acquired(_));
    }

    #[test]
    fn owner_id_embeds_identity() {
        let (backend, clock) = setup();
        let LeaseAcquisition::Acquired(lease) = acquire(&backend, &clock, 100) else {
            panic!("acquire");
        };
        let owner = lease.owner_id();
        assert!(owner.starts_with("caption@host-a:100/"));
        assert_eq!(owner.len(), "caption@host-a:100/".len() + 8);
        assert!(lease.release().unwrap());
        assert!(!lease.release().unwrap());
    }
}
