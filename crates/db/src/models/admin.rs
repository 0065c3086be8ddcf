//! Filters and reports for administrative bulk operations.

use medialib_core::job_status::JobStatus;
use medialib_core::types::DbId;
use serde::{Deserialize, Serialize};

/// Selects jobs for prune and force-cancel.
///
/// All set fields must match. `type_prefix` and `types` may be combined;
/// a job matches if either selects it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobFilter {
    pub type_prefix: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    /// Empty means every status.
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    /// Dedup-key prefix, e.g. `media:` or `library:photos/`.
    pub scope: Option<String>,
}

impl JobFilter {
    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefix = Some(prefix.into());
        self
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Input for `JobAdminRepo::prune`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PruneRequest {
    pub filter: JobFilter,
    /// Consider running jobs at all. Without `force_running` they are only
    /// flagged for cancellation.
    #[serde(default)]
    pub include_running: bool,
    /// Delete matching running jobs outright.
    #[serde(default)]
    pub force_running: bool,
    /// Count only; write nothing.
    #[serde(default)]
    pub dry_run: bool,
}

/// Outcome of a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub matched: u64,
    pub deleted: u64,
    /// Running jobs flagged with `cancel_requested` instead of deleted.
    pub updated: u64,
    /// Running jobs left untouched because running jobs were not included.
    pub blocked_running: u64,
    pub dry_run: bool,
}

/// Outcome of a force-cancel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForceCancelReport {
    pub matched: u64,
    /// Jobs newly flagged with `cancel_requested`.
    pub flagged: u64,
    /// Stale running jobs moved straight to `cancelled`.
    pub force_cancelled: u64,
    pub force_cancelled_ids: Vec<DbId>,
    pub dry_run: bool,
}
