//! Failure taxonomy shared by handlers, the retry scheduler and the reaper.
//!
//! A handler reports *what kind* of failure happened; the retry scheduler
//! alone decides whether that means another attempt or a terminal error.

use serde::{Deserialize, Serialize};

/// Maximum stored length of an error message, in characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 2_000;

/// Stable error codes persisted in `jobs.last_error_code`.
pub mod codes {
    pub const VALIDATION: &str = "validation_error";
    pub const CONFIG: &str = "config_error";
    pub const DEPENDENCY: &str = "dependency_error";
    pub const RESOURCE: &str = "resource_error";
    pub const FATAL: &str = "fatal_error";
    /// Reaper reclaimed a job whose owner stopped heart-beating.
    pub const STUCK_JOB: &str = "stuck_job";
    /// The handler task panicked.
    pub const HANDLER_PANIC: &str = "handler_panic";
    /// No handler is registered for the job type.
    pub const NO_HANDLER: &str = "no_handler";
    /// The handler timed out.
    pub const TIMEOUT: &str = "timeout";
}

/// Classification of a handler or engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed job or payload. Never retried.
    Validation,
    /// Misconfiguration on the worker side. Never retried.
    Config,
    /// A downstream service timed out or was unavailable.
    Dependency,
    /// Missing file, storage exhaustion, etc. The caller decides.
    Resource { retryable: bool },
    /// Handler-declared permanent failure.
    Fatal,
}

impl FailureKind {
    /// Whether this class of failure is eligible for another attempt.
    pub fn is_retryable(self) -> bool {
        match self {
            FailureKind::Dependency => true,
            FailureKind::Resource { retryable } => retryable,
            FailureKind::Validation | FailureKind::Config | FailureKind::Fatal => false,
        }
    }

    /// Error code used when the handler did not supply one.
    pub fn default_code(self) -> &'static str {
        match self {
            FailureKind::Validation => codes::VALIDATION,
            FailureKind::Config => codes::CONFIG,
            FailureKind::Dependency => codes::DEPENDENCY,
            FailureKind::Resource { .. } => codes::RESOURCE,
            FailureKind::Fatal => codes::FATAL,
        }
    }
}

/// A classified failure with a stable code and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_string(),
            message: truncate_chars(message.into(), MAX_ERROR_MESSAGE_LEN),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Config, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Dependency, message)
    }

    pub fn resource(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(FailureKind::Resource { retryable }, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    /// Override the default error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn truncate_chars(s: String, max: usize) -> String {
    if s.chars().count() <= max {
        s
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_failures_are_retryable() {
        assert!(JobFailure::dependency("vision model timed out").is_retryable());
    }

    #[test]
    fn validation_and_config_are_terminal() {
        assert!(!JobFailure::validation("missing media_id").is_retryable());
        assert!(!JobFailure::config("no model path").is_retryable());
        assert!(!JobFailure::fatal("unsupported codec").is_retryable());
    }

    #[test]
    fn resource_retryability_is_caller_classified() {
        assert!(JobFailure::resource("disk full", true).is_retryable());
        assert!(!JobFailure::resource("file deleted", false).is_retryable());
    }

    #[test]
    fn default_code_follows_kind() {
        assert_eq!(JobFailure::dependency("x").code, codes::DEPENDENCY);
        assert_eq!(
            JobFailure::dependency("x").with_code(codes::STUCK_JOB).code,
            codes::STUCK_JOB
        );
    }

    #[test]
    fn long_messages_are_truncated() {
        let failure = JobFailure::fatal("e".repeat(MAX_ERROR_MESSAGE_LEN + 50));
        assert_eq!(failure.message.chars().count(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn kind_serializes_with_class_tag() {
        let json = serde_json::to_value(FailureKind::Resource { retryable: true }).unwrap();
        assert_eq!(json, serde_json::json!({"class": "resource", "retryable": true}));
    }
}
