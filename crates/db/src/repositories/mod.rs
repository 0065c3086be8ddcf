//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&SqlitePool` as the first argument.

pub mod job_admin_repo;
pub mod job_repo;

pub use job_admin_repo::JobAdminRepo;
pub use job_repo::JobRepo;
