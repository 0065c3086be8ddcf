//! Operator CLI for the job table.
//!
//! Every command prints one JSON document on stdout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use medialib_core::clock::{Clock, SystemClock};
use medialib_core::job_status::JobStatus;
use medialib_core::types::DbId;
use medialib_db::models::admin::{JobFilter, PruneRequest};
use medialib_db::models::job::{EnqueueJob, JobListQuery};
use medialib_db::repositories::{JobAdminRepo, JobRepo};
use medialib_db::DbPool;
use medialib_events::JsonlAuditSink;
use medialib_worker::producer;
use medialib_worker::telemetry::init_tracing;
use medialib_worker::StaleThresholds;
use serde::Serialize;
use serde_json::{json, Value};

/// Administer the media library job queue.
#[derive(Parser)]
#[command(name = "medialib-admin")]
#[command(version)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://medialib.db", global = true)]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job. Prints the job id and whether it was deduplicated.
    Enqueue(EnqueueArgs),

    /// List jobs, newest first.
    List(ListArgs),

    /// Show one job.
    Show {
        id: DbId,
    },

    /// Request cooperative cancellation of an active job.
    Cancel {
        id: DbId,
    },

    /// Delete jobs matching a filter.
    ///
    /// Running jobs are reported as blocked unless `--include-running` is
    /// given, in which case they are flagged for cancellation; add
    /// `--force-running` to delete them outright.
    Prune(PruneArgs),

    /// Flag matching active jobs for cancellation and move running jobs
    /// with a stale heartbeat straight to cancelled.
    ForceCancel(ForceCancelArgs),
}

#[derive(Args)]
struct EnqueueArgs {
    job_type: String,

    /// Payload as a JSON object.
    #[arg(long, default_value = "{}")]
    payload: String,

    #[arg(long)]
    dedup_key: Option<String>,

    /// Enqueue as `pending` instead of `queued`.
    #[arg(long)]
    pending: bool,

    /// Audit log receiving the `enqueue` event.
    #[arg(long, env = "AUDIT_LOG_PATH", default_value = "./run/audit.jsonl")]
    audit_log: PathBuf,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    status: Option<JobStatus>,

    #[arg(long = "type")]
    job_type: Option<String>,

    #[arg(long, default_value_t = 50)]
    limit: i64,

    #[arg(long, default_value_t = 0)]
    offset: i64,
}

#[derive(Args)]
struct FilterArgs {
    /// Match job types starting with this prefix.
    #[arg(long)]
    type_prefix: Option<String>,

    /// Match these job types (repeatable).
    #[arg(long = "type")]
    types: Vec<String>,

    /// Restrict to these statuses (repeatable). Defaults to all.
    #[arg(long = "status")]
    statuses: Vec<JobStatus>,

    /// Dedup-key prefix, e.g. `media:`.
    #[arg(long)]
    scope: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> JobFilter {
        JobFilter {
            type_prefix: self.type_prefix,
            types: self.types,
            statuses: self.statuses,
            scope: self.scope,
        }
    }
}

#[derive(Args)]
struct PruneArgs {
    #[command(flatten)]
    filter: FilterArgs,

    #[arg(long)]
    include_running: bool,

    #[arg(long, requires = "include_running")]
    force_running: bool,

    /// Report counts without changing anything.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ForceCancelArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Heartbeat age after which a running job is cancelled outright.
    /// Defaults to `FORCE_CANCEL_STALE_SECS`, then
    /// `STUCK_JOB_THRESHOLD_SECS`, then 300.
    #[arg(long)]
    stale_secs: Option<u64>,

    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("medialib_worker=warn,medialib_db=warn");

    let cli = Cli::parse();
    let pool = medialib_db::create_pool(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;
    medialib_db::run_migrations(&pool)
        .await
        .context("failed to migrate job store")?;

    let output = execute(&pool, cli.command, &SystemClock).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn execute(pool: &DbPool, command: Command, clock: &dyn Clock) -> Result<Value> {
    let now = clock.now();
    match command {
        Command::Enqueue(args) => {
            let payload: Value =
                serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
            let mut input = EnqueueJob::new(args.job_type, payload);
            if let Some(key) = args.dedup_key {
                input = input.with_dedup_key(key);
            }
            if args.pending {
                input = input.pending();
            }
            let audit = JsonlAuditSink::open(&args.audit_log)
                .with_context(|| format!("failed to open {}", args.audit_log.display()))?;
            let descriptor = producer::enqueue(pool, &audit, &input, now).await?;
            to_json(&descriptor)
        }
        Command::List(args) => {
            let query = JobListQuery {
                status: args.status,
                job_type: args.job_type,
                limit: Some(args.limit),
                offset: Some(args.offset),
            };
            let jobs = JobRepo::list(pool, &query).await?;
            to_json(&jobs)
        }
        Command::Show { id } => {
            let job = JobRepo::find_by_id(pool, id)
                .await?
                .with_context(|| format!("job {id} not found"))?;
            to_json(&job)
        }
        Command::Cancel { id } => {
            let requested = JobRepo::request_cancel(pool, id, now).await?;
            Ok(json!({ "id": id, "cancel_requested": requested }))
        }
        Command::Prune(args) => {
            let request = PruneRequest {
                filter: args.filter.into_filter(),
                include_running: args.include_running,
                force_running: args.force_running,
                dry_run: args.dry_run,
            };
            let report = JobAdminRepo::prune(pool, &request, now).await?;
            to_json(&report)
        }
        Command::ForceCancel(args) => {
            let stale_after = match args.stale_secs {
                Some(secs) => Duration::from_secs(secs),
                None => StaleThresholds::from_env()?.force_cancel,
            };
            let report = JobAdminRepo::force_cancel(
                pool,
                &args.filter.into_filter(),
                stale_after,
                args.dry_run,
                now,
            )
            .await?;
            to_json(&report)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
