use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use devmgmt_server::cache::CachedJobRepository;
use devmgmt_server::command::{CommandDispatcher, ResponseCorrelator, TimeoutTracker};
use devmgmt_server::config::ServerConfig;
use devmgmt_server::control::{line, ControlRouter, JobEngineControl};
use devmgmt_server::datastore::IndexAuditListener;
use devmgmt_server::events::{EventRecorder, HouseKeeper};
use devmgmt_server::job::{
    DeviceCommandProcessor, Job, JobCoordinator, ProcessorRegistry, DEVICE_COMMAND_PROCESSOR,
};
use devmgmt_server::session::{DeviceSession, SessionManager};
use devmgmt_server::store::{
    InMemoryEventStore, InMemoryJobExecutionStore, InMemoryJobStore, InMemoryJobTargetStore,
    InMemoryOperationStore,
};
use devmgmt_server::telemetry::init_tracing;
use devmgmt_server::translator::TranslatorRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    init_tracing(&config.log_level)?;

    info!(node_id = %config.node_id, listen_addr = %config.listen_addr, "Device management server starting");

    let shutdown = CancellationToken::new();
    let translators = Arc::new(TranslatorRegistry::with_defaults());
    let sessions = Arc::new(SessionManager::new());
    let correlator = Arc::new(ResponseCorrelator::new(translators.clone()));

    let event_store = Arc::new(InMemoryEventStore::new());
    let recorder = Arc::new(
        EventRecorder::new(event_store.clone(), &config.node_id)
            .with_claim_lease(Duration::from_millis(config.event_claim_lease_ms)),
    );
    recorder
        .subscribe(Arc::new(IndexAuditListener::new(config.index_granularity()?)))
        .await;

    let operations = Arc::new(InMemoryOperationStore::new());
    let dispatcher = Arc::new(CommandDispatcher::new(
        sessions.clone(),
        correlator.clone(),
        operations.clone(),
        recorder.clone(),
        translators,
        config.dispatcher_config()?,
    ));

    let jobs = Arc::new(CachedJobRepository::with_max_size(
        Arc::new(InMemoryJobStore::new()),
        config.job_cache_size,
    ));
    recorder.subscribe(Arc::new(jobs.invalidator())).await;

    let processors = ProcessorRegistry::new().with(
        DEVICE_COMMAND_PROCESSOR,
        Arc::new(DeviceCommandProcessor::new(dispatcher.clone(), operations)),
    );
    let coordinator = JobCoordinator::new(
        jobs,
        Arc::new(InMemoryJobTargetStore::new()),
        Arc::new(InMemoryJobExecutionStore::new()),
        processors,
        recorder.clone(),
        config.coordinator_config(),
    );
    let router = Arc::new(ControlRouter::new(
        JobEngineControl::new(coordinator.clone()),
        config.include_stack_trace,
    ));

    if let Some(path) = &config.jobs_file {
        for job in load_jobs(path).await? {
            let job_id = job.job_id.clone();
            if let Err(e) = coordinator.define_job(job).await {
                warn!(job_id = %job_id, error = %e, "Skipping job definition");
            }
        }
    }

    let relaunched = coordinator.resume_orphaned_executions().await?;
    if relaunched > 0 {
        info!(relaunched, "Resumed executions left running by the previous start");
    }

    let sweeper = TimeoutTracker::new(
        correlator.clone(),
        Duration::from_millis(config.pending_sweep_interval_ms),
    );
    let sweeper_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { sweeper.run(shutdown).await }
    });

    let housekeeper = HouseKeeper::new(
        event_store,
        recorder.clone(),
        Duration::from_secs(config.event_retention_secs),
    );
    let housekeeping_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let every = Duration::from_millis(config.housekeeping_interval_ms);
        async move { housekeeper.run(every, shutdown).await }
    });

    let control_listener = TcpListener::bind(&config.control_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.control_addr))?;
    info!(addr = %config.control_addr, "Control surface listening");
    let control_task = tokio::spawn(line::serve(control_listener, router, shutdown.clone()));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Accepting device agents");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let sessions = sessions.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    sessions.serve(DeviceSession::new(stream, addr), dispatcher).await;
                });
            }
        }
    }

    coordinator.shutdown().await;
    shutdown.cancel();
    for task in [sweeper_task, housekeeping_task, control_task] {
        if let Err(e) = task.await {
            error!(error = %e, "Background task failed");
        }
    }
    info!(pending = correlator.pending_count().await, "Server stopped");
    Ok(())
}

async fn load_jobs(path: &str) -> anyhow::Result<Vec<Job>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read jobs file {path}"))?;
    let jobs: Vec<Job> = serde_json::from_str(&raw).with_context(|| format!("Malformed jobs file {path}"))?;
    info!(count = jobs.len(), path, "Loaded job definitions");
    Ok(jobs)
}
