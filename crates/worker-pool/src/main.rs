//! ExecuStack Worker Pool binary.
//!
//! Runs a worker that receives deferred executions via NATS and runs them
//! against the shared store.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use execustack_control_plane::{
    bootstrap::build_stack,
    config::{AppConfig, DatabaseConfig},
    db::create_pool,
    engine::Orchestrator,
    nats::{self, NatsRealtime},
};
use execustack_tasks::create_default_registry;
use execustack_worker::{DeferredRunner, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,execustack_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ExecuStack Worker Pool");

    let config = WorkerConfig::from_env()?;
    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });
    tracing::info!(
        worker_id = %config.worker_id,
        nats_url = %config.nats_url,
        consumer = %config.nats_consumer,
        "Worker configuration loaded"
    );

    let pool = if app_config.in_memory {
        None
    } else {
        let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load database config, using defaults");
            DatabaseConfig::default()
        });
        Some(create_pool(&db_config).await?)
    };

    let client = nats::connect(&config.nats_url).await?;
    let realtime = Arc::new(NatsRealtime::new(client.clone()));
    let stack = build_stack(&app_config, pool, Some(client.clone()), realtime).await;
    let orchestrator = Orchestrator::new(Arc::new(create_default_registry()), stack)
        .with_publish_results(app_config.publish_results);

    let worker = Worker::new(config, client, DeferredRunner::new(Arc::new(orchestrator))).await?;

    // Handle shutdown signals
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down worker");
        }
    }

    tracing::info!("Worker stopped");
    Ok(())
}
