mod config;
mod engine;
mod error;
mod events;
mod executor;
mod fixer;
mod session;
mod settings;
#[cfg(test)]
mod testing;
mod workflow;

use anyhow::Context;
use autocoder_common::redis;
use autocoder_common::types::{Status, WorkflowJob};
use config::LanguageRegistry;
use engine::{DockerEngine, SandboxRuntime, WorkspacePolicy};
use executor::CodeExecutionService;
use fixer::{FixGenerator, HttpFixGenerator, NoFixGenerator};
use session::{SessionConfig, SessionManager};
use settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use workflow::{WorkflowConfig, WorkflowRequest, WorkflowRunner};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Autocoder worker booting...");

    let settings = Settings::from_env().context("Invalid worker settings")?;

    let registry = LanguageRegistry::load_or_builtin(&settings.languages_path)
        .map_err(|e| {
            error!("Failed to load language adapters: {:#}", e);
            error!("Check {}", settings.languages_path.display());
            e
        })?;
    info!(languages = ?registry.languages(), "Loaded language adapters");

    let engine = Arc::new(DockerEngine::new(
        WorkspacePolicy {
            root: settings.workspace_root.clone(),
            mode: settings.workspace_mode,
        },
        settings.sandbox_user.clone(),
    )?);
    engine.ping().await.context("Docker daemon is not reachable")?;
    info!("Connected to Docker daemon");

    let sessions = Arc::new(SessionManager::new(
        engine.clone(),
        SessionConfig {
            idle_timeout: settings.session_idle_timeout,
            default_timeout: settings.default_timeout,
            max_timeout: settings.max_timeout,
        },
    ));

    let shutdown = CancellationToken::new();
    let reaper = sessions.clone().spawn_reaper(settings.reap_interval, shutdown.clone());

    let service = Arc::new(CodeExecutionService::new(Arc::new(registry), sessions.clone()));

    let fixer: Arc<dyn FixGenerator> = match &settings.fix_service_url {
        Some(url) => {
            info!(url = %url, "Using HTTP fix generator");
            Arc::new(HttpFixGenerator::new(url.clone(), settings.fix_timeout)?)
        }
        None => {
            warn!("AUTOCODER_FIX_URL not set; failed workflows will end with no_fix");
            Arc::new(NoFixGenerator)
        }
    };

    let runner = Arc::new(WorkflowRunner::new(
        service,
        fixer,
        WorkflowConfig {
            retry_budget: settings.retry_budget,
            retry_provisioning: settings.retry_provisioning,
            fix_timeout: settings.fix_timeout,
        },
    ));

    // Connect to Redis
    let redis_url = autocoder_common::config::redis_url();
    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", redis_url);

    let slots = Arc::new(Semaphore::new(settings.max_concurrent_workflows));

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        warn!("Received shutdown signal, cancelling workflows...");
    };

    tokio::select! {
        result = worker_loop(&mut redis_conn, runner, slots.clone(), shutdown.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "Worker loop stopped");
            }
        },
        _ = ctrl_c => {},
    }

    // In-flight workflows hold child tokens and emit their cancelled terminal event
    shutdown.cancel();
    let total = settings.max_concurrent_workflows as u32;
    if tokio::time::timeout(DRAIN_TIMEOUT, slots.acquire_many(total)).await.is_err() {
        warn!("Timed out waiting for in-flight workflows");
    }

    sessions.close_all().await;
    let leftover = engine.live_count();
    if leftover > 0 {
        warn!(containers = leftover, "Removing sandboxes left after session close");
    }
    engine.shutdown().await;
    if let Err(e) = reaper.await {
        warn!(error = %e, "Session reaper task failed");
    }

    info!("Worker shutdown complete");
    Ok(())
}

async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    runner: Arc<WorkflowRunner>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        // Only take a job off the queue when a slot is free
        let permit = slots.clone().acquire_owned().await?;

        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(redis_conn, 5.0).await {
            Ok(Some(job)) => {
                info!(
                    workflow_id = %job.id,
                    session_id = %job.session_id,
                    language = %job.language,
                    timeout_ms = job.timeout_ms,
                    source_size = job.code.len(),
                    "Received workflow"
                );

                tokio::spawn(run_job(
                    runner.clone(),
                    redis_conn.clone(),
                    job,
                    shutdown.child_token(),
                    permit,
                ));
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Run one workflow, mirroring its events into Redis and watching the
/// cancel flag until the terminal event.
#[instrument(skip_all, fields(workflow_id = %job.id, session_id = %job.session_id))]
async fn run_job(
    runner: Arc<WorkflowRunner>,
    mut redis_conn: ::redis::aio::ConnectionManager,
    job: WorkflowJob,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let handle = runner.spawn(WorkflowRequest::from(job), cancel);
    let id = handle.id;
    let mut cursor = handle.events.subscribe();
    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);

    loop {
        tokio::select! {
            event = cursor.next() => match event {
                Some(event) => {
                    debug!(step = event.step, status = %event.status, "Mirroring event");
                    if let Err(e) = redis::append_event(&mut redis_conn, &id, &event).await {
                        error!(error = %e, "Failed to mirror event");
                    }
                }
                None => break,
            },
            _ = poll.tick(), if !handle.cancel.is_cancelled() => {
                match redis::is_cancelled(&mut redis_conn, &id).await {
                    Ok(true) => {
                        info!("Cancellation requested");
                        handle.cancel.cancel();
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Failed to read cancel flag"),
                }
            }
        }
    }

    let status = match handle.join.await {
        Ok(Ok(report)) => {
            if let Some(last) = report.steps.last() {
                debug!(
                    step = last.number,
                    kind = %last.kind,
                    language = %last.language,
                    failure = ?last.failure,
                    exit_code = last.result.as_ref().map(|r| r.exit_code),
                    error = last.error.as_deref(),
                    "Final step"
                );
            }
            info!(
                workflow_id = %report.id,
                final_code_bytes = report.final_code.len(),
                status = %report.status,
                steps = report.steps.len(),
                fix_requests = report.fix_requests(),
                cancelled = report.cancelled,
                "Workflow finished"
            );
            report.status
        }
        Ok(Err(e)) => {
            error!(error = %e, "Workflow not started");
            Status::Exhausted
        }
        Err(e) => {
            error!(error = %e, "Workflow task failed");
            Status::Exhausted
        }
    };

    if let Err(e) = redis::store_status(&mut redis_conn, &id, status).await {
        error!(error = %e, "Failed to persist workflow status");
    }
}
