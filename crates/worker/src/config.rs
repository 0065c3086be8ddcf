use std::path::PathBuf;
use std::time::Duration;

use medialib_core::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Lease scope: at most one live worker per type per lease directory.
    pub worker_type: String,
    /// Job types this worker claims.
    pub job_types: Vec<String>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease_liveness: Duration,
    pub lease_dir: PathBuf,
    /// Running jobs silent for longer than this are reaped.
    pub stuck_threshold: Duration,
    pub retry: RetryPolicy,
    pub audit_log_path: PathBuf,
    pub error_log_path: PathBuf,
    /// Per-attempt trace artifacts are written here when set.
    pub trace_dir: Option<PathBuf>,
    /// Program and arguments of the external-command handler.
    pub handler_command: Option<Vec<String>>,
    pub handler_timeout: Duration,
    /// Run a single tick and exit.
    pub run_once: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default               |
    /// |----------------------------|-----------------------|
    /// | `DATABASE_URL`             | `sqlite://medialib.db`|
    /// | `WORKER_TYPE`              | required              |
    /// | `WORKER_JOB_TYPES`         | `WORKER_TYPE`         |
    /// | `WORKER_BATCH_SIZE`        | `1`                   |
    /// | `POLL_INTERVAL_MS`         | `2000`                |
    /// | `HEARTBEAT_INTERVAL_SECS`  | `5`                   |
    /// | `LEASE_LIVENESS_SECS`      | `30`                  |
    /// | `LEASE_DIR`                | `./run/leases`        |
    /// | `STUCK_JOB_THRESHOLD_SECS` | `300`                 |
    /// | `MAX_ATTEMPTS`             | `3`                   |
    /// | `BASE_BACKOFF_SECS`        | `30`                  |
    /// | `MAX_BACKOFF_SECS`         | `3600`                |
    /// | `AUDIT_LOG_PATH`           | `./run/audit.jsonl`   |
    /// | `ERROR_LOG_PATH`           | `./run/errors.jsonl`  |
    /// | `TRACE_DIR`                | unset                 |
    /// | `HANDLER_COMMAND`          | unset                 |
    /// | `HANDLER_TIMEOUT_SECS`     | `600`                 |
    /// | `RUN_ONCE`                 | `false`               |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").unwrap_or_else(|| "sqlite://medialib.db".into());

        let worker_type = get("WORKER_TYPE")
            .map(|v| v.trim().to_string())
            .ok_or(ConfigError::Missing("WORKER_TYPE"))?;

        let job_types: Vec<String> = match get("WORKER_JOB_TYPES") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => vec![worker_type.clone()],
        };
        if job_types.is_empty() {
            return Err(ConfigError::Inconsistent(
                "WORKER_JOB_TYPES names no job types".into(),
            ));
        }

        let batch_size: usize = parse(&get, "WORKER_BATCH_SIZE", 1)?;
        if batch_size == 0 {
            return Err(invalid("WORKER_BATCH_SIZE", "0", "must be at least 1"));
        }

        let poll_interval = Duration::from_millis(parse(&get, "POLL_INTERVAL_MS", 2000)?);
        let heartbeat_interval = Duration::from_secs(parse(&get, "HEARTBEAT_INTERVAL_SECS", 5)?);
        let lease_liveness = Duration::from_secs(parse(&get, "LEASE_LIVENESS_SECS", 30)?);
        let lease_dir = get("LEASE_DIR").unwrap_or_else(|| "./run/leases".into()).into();

        let stuck_threshold = StaleThresholds::from_lookup(&get)?.stuck;

        let retry = RetryPolicy {
            max_attempts: parse(&get, "MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            base_backoff: Duration::from_secs(parse(&get, "BASE_BACKOFF_SECS", 30)?),
            max_backoff: Duration::from_secs(parse(&get, "MAX_BACKOFF_SECS", 3600)?),
        };
        if retry.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let audit_log_path = get("AUDIT_LOG_PATH")
            .unwrap_or_else(|| "./run/audit.jsonl".into())
            .into();
        let error_log_path = get("ERROR_LOG_PATH")
            .unwrap_or_else(|| "./run/errors.jsonl".into())
            .into();
        let trace_dir = get("TRACE_DIR").map(PathBuf::from);

        let handler_command = get("HANDLER_COMMAND").map(|cmd| {
            cmd.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        let handler_timeout = Duration::from_secs(parse(&get, "HANDLER_TIMEOUT_SECS", 600)?);

        let run_once = match get("RUN_ONCE").as_deref().map(str::to_ascii_lowercase) {
            None => false,
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no") => false,
            Some(v) => return Err(invalid("RUN_ONCE", &v, "expected true or false")),
        };

        let config = Self {
            database_url,
            worker_type,
            job_types,
            batch_size,
            poll_interval,
            heartbeat_interval,
            lease_liveness,
            lease_dir,
            stuck_threshold,
            retry,
            audit_log_path,
            error_log_path,
            trace_dir,
            handler_command,
            handler_timeout,
            run_once,
        };
        config.validate()?;
        Ok(config)
    }

    /// Heartbeats must land well inside both liveness windows, or a healthy
    /// worker would be judged dead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "HEARTBEAT_INTERVAL_SECS must be positive".into(),
            ));
        }
        if self.heartbeat_interval * 2 >= self.lease_liveness {
            return Err(ConfigError::Inconsistent(format!(
                "heartbeat interval {:?} must be shorter than half the lease liveness window {:?}",
                self.heartbeat_interval, self.lease_liveness
            )));
        }
        if self.heartbeat_interval >= self.stuck_threshold {
            return Err(ConfigError::Inconsistent(format!(
                "heartbeat interval {:?} must be shorter than the stuck-job threshold {:?}",
                self.heartbeat_interval, self.stuck_threshold
            )));
        }
        Ok(())
    }
}

/// Heartbeat ages after which a running job is presumed abandoned.
///
/// Shared by the worker (reaping) and the admin CLI (force-cancel).
///
/// | Env Var                    | Default         |
/// |----------------------------|-----------------|
/// | `STUCK_JOB_THRESHOLD_SECS` | `300`           |
/// | `FORCE_CANCEL_STALE_SECS`  | stuck threshold |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleThresholds {
    pub stuck: Duration,
    pub force_cancel: Duration,
}

impl StaleThresholds {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let stuck_secs: u64 = parse(&get, "STUCK_JOB_THRESHOLD_SECS", 300)?;
        let force_cancel_secs: u64 = parse(&get, "FORCE_CANCEL_STALE_SECS", stuck_secs)?;
        Ok(Self {
            stuck: Duration::from_secs(stuck_secs),
            force_cancel: Duration::from_secs(force_cancel_secs),
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("WORKER_TYPE", "caption")]).unwrap();
        assert_eq!(config.job_types, vec!["caption".to_string()]);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.stuck_threshold, Duration::from_secs(300));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.trace_dir, None);
        assert!(!config.run_once);
    }

    #[test]
    fn worker_type_is_required() {
        assert_matches!(load(&[]), Err(ConfigError::Missing("WORKER_TYPE")));
    }

    #[test]
    fn job_types_and_command_are_split() {
        let config = load(&[
            ("WORKER_TYPE", "ai"),
            ("WORKER_JOB_TYPES", "caption, nsfw_score,,duplicate_hint"),
            ("HANDLER_COMMAND", "python3 handlers/run.py --json"),
            ("RUN_ONCE", "true"),
        ])
        .unwrap();
        assert_eq!(config.job_types, vec!["caption", "nsfw_score", "duplicate_hint"]);
        assert_eq!(
            config.handler_command,
            Some(vec!["python3".into(), "handlers/run.py".into(), "--json".into()])
        );
        assert!(config.run_once);
    }

    // -----------------------------------------------------------------------
    // Stale thresholds
    // -----------------------------------------------------------------------

    fn thresholds(vars: &[(&str, &str)]) -> Result<StaleThresholds, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StaleThresholds::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn force_cancel_follows_stuck_threshold() {
        let t = thresholds(&[("STUCK_JOB_THRESHOLD_SECS", "120")]).unwrap();
        assert_eq!(t.stuck, Duration::from_secs(120));
        assert_eq!(t.force_cancel, Duration::from_secs(120));

        let t = thresholds(&[]).unwrap();
        assert_eq!(t.force_cancel, Duration::from_secs(300));
    }

    #[test]
    fn force_cancel_can_be_set_on_its_own() {
        let t = thresholds(&[
            ("STUCK_JOB_THRESHOLD_SECS", "120"),
            ("FORCE_CANCEL_STALE_SECS", "900"),
        ])
        .unwrap();
        assert_eq!(t.stuck, Duration::from_secs(120));
        assert_eq!(t.force_cancel, Duration::from_secs(900));
    }

    #[test]
    fn bad_numbers_are_reported() {
        assert_matches!(
            load(&[("WORKER_TYPE", "scan"), ("MAX_ATTEMPTS", "lots")]),
            Err(ConfigError::Invalid { var: "MAX_ATTEMPTS", .. })
        );
    }

    #[test]
    fn heartbeat_must_fit_liveness_window() {
        assert_matches!(
            load(&[
                ("WORKER_TYPE", "scan"),
                ("HEARTBEAT_INTERVAL_SECS", "20"),
                ("LEASE_LIVENESS_SECS", "30"),
            ]),
            Err(ConfigError::Inconsistent(_))
        );
        assert_matches!(
            load(&[
                ("WORKER_TYPE", "scan"),
                ("HEARTBEAT_INTERVAL_SECS", "10"),
                ("LEASE_LIVENESS_SECS", "60"),
                ("STUCK_JOB_THRESHOLD_SECS", "10"),
            ]),
            Err(ConfigError::Inconsistent(_))
        );
    }
}
