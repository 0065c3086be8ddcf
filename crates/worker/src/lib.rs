//! Worker processes for the media library job queue.
//!
//! A worker holds a [`lease::WorkerLease`] for its worker type, then runs a
//! [`worker_loop::WorkerLoop`] that reaps stuck jobs, claims batches, and
//! hands each job to a registered [`handler::JobHandler`].

pub mod cancellation;
pub mod claimer;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod lease;
pub mod producer;
pub mod reaper;
pub mod retry;
pub mod telemetry;
pub mod trace;
pub mod worker_loop;

pub use config::{ConfigError, StaleThresholds, WorkerConfig};
pub use error::WorkerError;
pub use handler::{HandlerRegistry, JobContext, JobHandler, Outcome};
pub use worker_loop::{LoopSettings, TickReport, WorkerLoop};
