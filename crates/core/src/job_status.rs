//! Job status values.
//!
//! Statuses are persisted as lowercase TEXT so external tooling can read the
//! job table without a lookup table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

/// Statuses a worker may claim from.
pub const CLAIMABLE_STATUSES: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Queued];

/// Statuses that count as "in flight" for dedup purposes.
pub const ACTIVE_STATUSES: [JobStatus; 3] =
    [JobStatus::Pending, JobStatus::Queued, JobStatus::Running];

/// Terminal statuses: done, error, cancelled.
pub const TERMINAL_STATUSES: [JobStatus; 3] =
    [JobStatus::Done, JobStatus::Error, JobStatus::Cancelled];

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Error,
        JobStatus::Cancelled,
    ];

    /// The TEXT value stored in the `jobs.status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        TERMINAL_STATUSES.contains(&self)
    }

    pub fn is_claimable(self) -> bool {
        CLAIMABLE_STATUSES.contains(&self)
    }

    pub fn is_active(self) -> bool {
        ACTIVE_STATUSES.contains(&self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::Validation(format!("Unknown job status: \"{s}\"")))
    }
}
