mod config;
mod docker;
mod engine;
mod error;
mod evaluator;
mod events;
mod executor;
mod health;
mod llm;
mod metrics;
mod pipeline;
mod stages;
mod sweeper;
mod worker;

#[cfg(test)]
mod pipeline_tests;

use anyhow::Context;
use caseforge_common::types::QueueKind;
use caseforge_common::{Backends, LanguageTable};
use config::{SandboxBackend, WorkerConfig};
use docker::DockerEngine;
use engine::{ExecutionEngine, ProcessEngine, Sandbox};
use events::{EventObserver, RedisEventPublisher, TracingObserver};
use llm::{HintGenerator, HttpLlmClient, SolutionGenerator, UnconfiguredLlm};
use pipeline::{Orchestrator, RetryPolicy};
use stages::{StageDeps, StageSettings};
use std::sync::Arc;
use sweeper::Sweeper;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use worker::WorkerPool;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = WorkerConfig::from_env();
    init_tracing(config.json_logs);

    info!(worker_id = %config.worker_id, "Caseforge worker booting...");
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    metrics::init_metrics().context("failed to register metrics")?;

    // Language dispatch table
    let languages = LanguageTable::load_or_builtin(&config.languages_config).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Fix {} or remove it to use the built-in table", config.languages_config.display());
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.names());

    // Sandbox
    let engine: Arc<dyn ExecutionEngine> = match config.sandbox_backend {
        SandboxBackend::Process => Arc::new(match &config.scratch_root {
            Some(root) => ProcessEngine::with_scratch_root(root),
            None => ProcessEngine::new(),
        }),
        SandboxBackend::Docker => Arc::new(
            DockerEngine::connect(config.scratch_root.clone())
                .context("failed to connect to Docker")?,
        ),
    };
    let sandbox = Sandbox::new(
        engine,
        languages,
        config.sandbox_max_concurrency,
        config.compile_timeout,
    );
    info!(
        engine = sandbox.engine_name(),
        max_concurrency = config.sandbox_max_concurrency,
        "Sandbox ready"
    );

    // Storage and queues
    let backends = Backends::open(&config.common)
        .await
        .context("failed to open storage backend")?;
    info!(backend = ?config.common.store_backend, "Connected to job store");

    // LLM collaborator
    let (author, hints): (Arc<dyn SolutionGenerator>, Arc<dyn HintGenerator>) =
        match &config.llm_endpoint {
            Some(endpoint) => {
                let client = Arc::new(HttpLlmClient::new(
                    endpoint.clone(),
                    config.llm_api_key.clone(),
                    config.llm_timeout,
                )?);
                info!(endpoint = %endpoint, "LLM collaborator configured");
                let author: Arc<dyn SolutionGenerator> = client.clone();
                let hints: Arc<dyn HintGenerator> = client;
                (author, hints)
            }
            None => {
                warn!("LLM_ENDPOINT not set: authoring stages will fail and hints are disabled");
                let author: Arc<dyn SolutionGenerator> = Arc::new(UnconfiguredLlm);
                let hints: Arc<dyn HintGenerator> = Arc::new(UnconfiguredLlm);
                (author, hints)
            }
        };

    let deps = StageDeps {
        sandbox: sandbox.clone(),
        testcases: backends.testcases(),
        author,
        hints,
        settings: StageSettings {
            llm_timeout: config.llm_timeout,
            hint_case_limit: config.hint_case_limit,
            generated_case_count: config.generated_case_count,
        },
    };

    let mut observers: Vec<Arc<dyn EventObserver>> = vec![Arc::new(TracingObserver)];
    if let Some(conn) = &backends.redis {
        observers.push(Arc::new(RedisEventPublisher::new(conn.clone())));
    }

    let mut orchestrator = Orchestrator::new(
        backends.jobs(),
        backends.queue.clone(),
        stages::registry(deps),
        RetryPolicy {
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        },
    );
    for observer in &observers {
        orchestrator = orchestrator.with_observer(observer.clone());
    }
    let orchestrator = Arc::new(orchestrator);

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for kind in QueueKind::all_variants() {
        let pool = WorkerPool::new(*kind, config.pool_size(*kind));
        handles.extend(pool.spawn(
            &config.worker_id,
            backends.queue.clone(),
            orchestrator.clone(),
            shutdown_rx.clone(),
        ));
    }

    let mut sweeper = Sweeper::new(backends.jobs(), backends.queue.clone(), config.processing_timeout)?;
    for observer in observers {
        sweeper = sweeper.with_observer(observer);
    }
    handles.push(tokio::spawn(sweeper.run(
        config.sweep_interval,
        config.promote_interval,
        shutdown_rx.clone(),
    )));

    let health_state = health::HealthState {
        worker_id: config.worker_id.clone(),
        sandbox: sandbox.engine_name(),
        queue: backends.queue.clone(),
    };
    let health_addr = config.health_addr.clone();
    let health_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = health::serve(&health_addr, health_state, health_shutdown).await {
            error!(error = %e, "Health server stopped");
        }
    }));

    info!("Ready to process jobs");
    signal::ctrl_c()
        .await
        .context("failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, finishing in-flight jobs...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
