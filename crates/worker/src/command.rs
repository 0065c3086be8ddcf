//! Runs jobs by spawning an external program.
//!
//! The program receives one JSON document on stdin:
//!
//! ```json
//! {"job": {"id": 1, "job_type": "caption", "attempt": 1, "owner": "...", "dedup_key": "media:7"},
//!  "payload": {"media_id": 7}}
//! ```
//!
//! and reports through its exit status:
//!
//! | Exit | Outcome                                               |
//! |------|-------------------------------------------------------|
//! | 0    | done; stdout parsed as JSON becomes the result        |
//! | 2    | validation failure (not retried)                      |
//! | 3    | cancelled                                             |
//! | else | dependency failure (retried); stderr is the message   |

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use medialib_core::failure::{codes, JobFailure};
use medialib_core::hashing::command_fingerprint;
use medialib_core::types::DbId;
use medialib_db::models::job::Job;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::ConfigError;
use crate::handler::{JobContext, JobHandler, Outcome};

/// Maximum stdout or stderr captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_CANCELLED: i32 = 3;

/// Job identity passed to the program alongside the payload.
#[derive(Debug, Clone, Serialize)]
pub struct CommandJob {
    pub id: DbId,
    pub job_type: String,
    pub attempt: i32,
    pub owner: String,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub job: CommandJob,
    pub payload: Value,
}

impl CommandRequest {
    pub fn new(job: &Job, attempt: i32, owner: impl Into<String>) -> Self {
        Self {
            job: CommandJob {
                id: job.id,
                job_type: job.job_type.clone(),
                attempt,
                owner: owner.into(),
                dedup_key: job.dedup_key.clone(),
            },
            payload: job.payload.clone(),
        }
    }
}

/// What one run of the program produced.
#[derive(Debug, Clone)]
pub struct CommandRun {
    pub outcome: Outcome,
    /// `None` when the program never exited (spawn error or timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandRun {
    fn without_exit(outcome: Outcome, started: Instant) -> Self {
        Self {
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Trace document describing the run.
    pub fn to_trace(&self) -> Value {
        json!({
            "exit_code": self.exit_code,
            "duration_ms": self.duration_ms,
            "stdout": self.stdout,
            "stderr": self.stderr,
        })
    }
}

/// [`JobHandler`] that delegates every job to one external program.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    fingerprint: String,
}

impl CommandHandler {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let fingerprint = command_fingerprint(argv.as_slice());
        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or(ConfigError::Missing("HANDLER_COMMAND"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
            fingerprint,
        })
    }

    /// Stable hash of the command line, recorded in the worker lease.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn the program for one request and classify the result.
    ///
    /// The timeout covers the whole exchange: feeding stdin, draining
    /// output and waiting for exit.
    pub async fn run(&self, request: &CommandRequest) -> CommandRun {
        let started = Instant::now();

        let input = match serde_json::to_vec(request) {
            Ok(bytes) => bytes,
            Err(e) => {
                let failure = JobFailure::fatal(format!("failed to encode request: {e}"));
                return CommandRun::without_exit(Outcome::Failed(failure), started);
            }
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("MEDIALIB_JOB_ID", request.job.id.to_string())
            .env("MEDIALIB_JOB_TYPE", &request.job.job_type)
            .env("MEDIALIB_ATTEMPT", request.job.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let failure =
                    JobFailure::config(format!("failed to spawn {}: {e}", self.program));
                return CommandRun::without_exit(Outcome::Failed(failure), started);
            }
        };

        // Readers start before the write so a program that answers before
        // draining its input cannot block on a full pipe.
        let mut stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_stream(child.stderr.take()));
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The program may exit without reading stdin.
                let _ = stdin.write_all(&input).await;
            })
        });

        let abort_io = || {
            stdout_task.abort();
            stderr_task.abort();
            if let Some(task) = &stdin_task {
                task.abort();
            }
        };

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                abort_io();
                let failure = JobFailure::dependency(format!("failed to wait for handler: {e}"));
                return CommandRun::without_exit(Outcome::Failed(failure), started);
            }
            Err(_elapsed) => {
                // `kill_on_drop` would do this too, once `child` goes out
                // of scope.
                let _ = child.start_kill();
                abort_io();
                let failure = JobFailure::dependency(format!(
                    "handler timed out after {}s",
                    self.timeout.as_secs()
                ))
                .with_code(codes::TIMEOUT);
                return CommandRun::without_exit(Outcome::Failed(failure), started);
            }
        };
        if let Some(task) = &stdin_task {
            task.abort();
        }

        // Output is bounded by the same deadline; a background process that
        // inherited the pipes can keep them open after the program exits.
        let remaining = self.timeout.saturating_sub(started.elapsed());
        let drained = tokio::time::timeout(remaining, async {
            (
                (&mut stdout_task).await.unwrap_or_default(),
                (&mut stderr_task).await.unwrap_or_default(),
            )
        })
        .await;
        let (out, err) = match drained {
            Ok(output) => output,
            Err(_elapsed) => {
                stdout_task.abort();
                stderr_task.abort();
                (Vec::new(), Vec::new())
            }
        };

        let stdout = String::from_utf8_lossy(&out).into_owned();
        let stderr = String::from_utf8_lossy(&err).into_owned();
        let exit_code = status.code().unwrap_or(-1);

        CommandRun {
            outcome: classify(exit_code, &stdout, &stderr),
            exit_code: Some(exit_code),
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, ctx: &JobContext, job: &Job) -> Outcome {
        let request = CommandRequest::new(job, ctx.attempt(), ctx.owner());
        if let Ok(doc) = serde_json::to_value(&request) {
            ctx.trace("request", &doc).await;
        }

        let run = self.run(&request).await;
        ctx.trace("response", &run.to_trace()).await;

        tracing::debug!(
            job_id = job.id,
            exit_code = ?run.exit_code,
            duration_ms = run.duration_ms,
            "Handler command finished",
        );
        run.outcome
    }
}

fn classify(exit_code: i32, stdout: &str, stderr: &str) -> Outcome {
    let message = || {
        let tail = stderr.trim();
        if tail.is_empty() {
            format!("handler exited with status {exit_code}")
        } else {
            tail.to_string()
        }
    };

    match exit_code {
        0 => {
            let trimmed = stdout.trim();
            let result = if trimmed.is_empty() {
                None
            } else {
                Some(
                    serde_json::from_str(trimmed)
                        .unwrap_or_else(|_| json!({ "stdout": trimmed })),
                )
            };
            Outcome::Done { result }
        }
        EXIT_VALIDATION => Outcome::Failed(JobFailure::validation(message())),
        EXIT_CANCELLED => Outcome::Cancelled {
            reason: Some(message()),
        },
        _ => Outcome::Failed(JobFailure::dependency(message())),
    }
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}
