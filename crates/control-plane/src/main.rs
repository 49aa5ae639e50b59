//! ExecuStack Control Plane Server
//!
//! Serves the execution API and realtime streams, backed by PostgreSQL and
//! (optionally) NATS.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use execustack_control_plane::{
    bootstrap::build_stack,
    clients::ensure_admin_client,
    config::{AppConfig, DatabaseConfig},
    db::{create_pool, migrate, DbPool},
    engine::Orchestrator,
    nats::{self, spawn_relay},
    realtime::RealtimeHub,
    routes::build_router,
    state::AppState,
};
use execustack_tasks::create_default_registry;

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,execustack_control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to NATS if configured.
async fn connect_nats(config: &AppConfig) -> Option<async_nats::Client> {
    let Some(ref nats_url) = config.nats_url else {
        tracing::info!("NATS not configured, running without messaging");
        return None;
    };
    match nats::connect(nats_url).await {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, url = %nats_url, "Failed to connect to NATS, continuing without it");
            None
        }
    }
}

/// Connect to PostgreSQL and apply the schema, unless running in memory.
async fn connect_database(config: &AppConfig) -> anyhow::Result<Option<DbPool>> {
    if config.in_memory {
        return Ok(None);
    }

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });
    let pool = create_pool(&db_config).await?;
    migrate(&pool).await?;
    Ok(Some(pool))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ExecuStack Control Plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        in_memory = app_config.in_memory,
        publish_results = app_config.publish_results,
        "Configuration loaded"
    );

    let db_pool = connect_database(&app_config).await?;
    let nats_client = connect_nats(&app_config).await;

    let hub = Arc::new(RealtimeHub::new());
    if let Some(client) = nats_client.clone() {
        spawn_relay(client, hub.clone());
    }

    let stack = build_stack(&app_config, db_pool.clone(), nats_client, hub.clone()).await;
    let orchestrator = Orchestrator::new(Arc::new(create_default_registry()), stack)
        .with_publish_results(app_config.publish_results);

    ensure_admin_client(
        &orchestrator,
        &app_config.admin_client_id,
        &app_config.admin_api_key,
    )
    .await?;

    let mut state = AppState::new(app_config.clone(), orchestrator, hub);
    if let Some(pool) = db_pool {
        state = state.with_db_pool(pool);
    }
    let app = build_router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
