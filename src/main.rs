//! jobforge server entry point.

use std::sync::Arc;
use std::time::Duration;

use jobforge::api::{build_router, AppState};
use jobforge::backup::BackupEngine;
use jobforge::config::Config;
use jobforge::jobs::{JobHandlerRegistry, JobQueue, JobWorker, TaskScheduler};
use jobforge::mailer::LogMailer;
use jobforge::store::MemoryStore;
use jobforge::{observability, Result};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real deployments use the environment directly.
    let _ = dotenvy::dotenv();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration, using defaults: {}", e);
            Config::default()
        }
    };
    observability::init(&config.observability);

    run(config).await?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new("jobforge"));
    let mailer = Arc::new(LogMailer);
    let backup = Arc::new(BackupEngine::new(store.clone(), &config.backup));

    let registry = Arc::new(JobHandlerRegistry::builtin(
        store.clone(),
        mailer.clone(),
        backup.clone(),
        &config.mailer,
    ));

    let queue = Arc::new(JobQueue::new(&config.broker, registry));
    queue
        .initialize(Duration::from_secs(config.broker.connect_timeout_secs))
        .await;
    let worker = JobWorker::new(queue.clone(), &config.broker).start();

    let scheduler = Arc::new(TaskScheduler::new(&config.scheduler.timezone)?);
    scheduler.register_builtin(queue.clone(), &config.scheduler)?;
    scheduler.start_all();

    let state = AppState {
        queue,
        scheduler: scheduler.clone(),
        backup,
        store,
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(jobforge::ForgeError::from)?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(jobforge::ForgeError::from)?;

    tracing::info!("Shutting down");
    scheduler.shutdown();
    worker.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
