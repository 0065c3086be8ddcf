//! Domain types shared by every medialib crate.
//!
//! This crate has zero internal dependencies so the store, the audit sink,
//! the worker and any CLI tooling can all agree on job statuses, failure
//! classes, retry math and payload shapes without depending on each other.

pub mod audit;
pub mod clock;
pub mod error;
pub mod failure;
pub mod hashing;
pub mod job_status;
pub mod payload;
pub mod retry;
pub mod types;
