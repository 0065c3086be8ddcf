use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use medialib_core::clock::{Clock, SystemClock};
use medialib_events::{AuditSink, ErrorRecord, ErrorSink, JsonlAuditSink};
use medialib_worker::command::CommandHandler;
use medialib_worker::lease::{
    current_host, FsLeaseBackend, LeaseAcquisition, LeaseBackend, LeaseSpec, WorkerLease,
};
use medialib_worker::telemetry::{init_tracing, DEFAULT_FILTER};
use medialib_worker::trace::TraceWriter;
use medialib_worker::{
    ConfigError, HandlerRegistry, LoopSettings, WorkerConfig, WorkerError, WorkerLoop,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing(DEFAULT_FILTER);

    // --- Configuration ---
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let path = std::env::var("ERROR_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./run/errors.jsonl"));
            let err = WorkerError::from(e);
            report_failure(&path, None, &err);
            return ExitCode::FAILURE;
        }
    };

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&config.error_log_path, Some(config.worker_type.as_str()), &e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &WorkerConfig) -> Result<(), WorkerError> {
    // --- Handler ---
    let argv = config
        .handler_command
        .clone()
        .ok_or(ConfigError::Missing("HANDLER_COMMAND"))?;
    let handler = Arc::new(CommandHandler::new(argv, config.handler_timeout)?);

    // --- Database ---
    let pool = medialib_db::create_pool(&config.database_url).await?;
    medialib_db::run_migrations(&pool).await?;
    medialib_db::health_check(&pool).await?;
    tracing::info!(database_url = %config.database_url, "Job store ready");

    // --- Lease ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend: Arc<dyn LeaseBackend> = Arc::new(FsLeaseBackend::new(&config.lease_dir)?);
    let spec = LeaseSpec::for_current_process(
        config.worker_type.clone(),
        config.lease_liveness,
        handler.fingerprint(),
    );
    let lease = match WorkerLease::acquire(backend, Arc::clone(&clock), spec)? {
        LeaseAcquisition::Acquired(lease) => Arc::new(lease),
        LeaseAcquisition::Busy(holder) => {
            tracing::info!(
                worker_type = %config.worker_type,
                holder_pid = ?holder.as_ref().map(|h| h.pid),
                holder_host = ?holder.as_ref().map(|h| h.host.as_str()),
                "Another instance is active, exiting",
            );
            return Ok(());
        }
    };

    // --- Loop ---
    let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::open(&config.audit_log_path)?);
    let registry = HandlerRegistry::new().with_fallback(handler);
    let mut worker = WorkerLoop::new(
        pool,
        Arc::clone(&lease),
        clock,
        registry,
        audit,
        LoopSettings::from_config(config),
    );
    if let Some(dir) = &config.trace_dir {
        worker = worker.with_trace_writer(TraceWriter::new(dir));
    }

    let token = worker.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    let result = worker.run().await;
    drop(worker);

    if let Err(e) = lease.release() {
        tracing::warn!(error = %e, "Failed to release lease");
    }
    result.map(|_| ())
}

fn report_failure(path: &std::path::Path, worker_type: Option<&str>, err: &WorkerError) {
    tracing::error!(component = err.component(), error = %err, "Worker aborted");

    let mut record = ErrorRecord::new(
        err.component(),
        &err.to_string(),
        current_host(),
        SystemClock.now(),
    );
    if let Some(worker_type) = worker_type {
        record = record.with_worker_type(worker_type);
    }
    match ErrorSink::open(path) {
        Ok(sink) => sink.record_or_log(&record),
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "Failed to open error sink");
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), finishing current job");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, finishing current job");
        }
    }
}
