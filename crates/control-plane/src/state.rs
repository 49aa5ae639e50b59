//! Application state for the ExecuStack Control Plane server.

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::engine::Orchestrator;
use crate::realtime::RealtimeHub;
use execustack_tasks::Stack;
use std::sync::Arc;

/// Shared application state.
///
/// Wrapped in `Arc`s and passed to handlers via Axum's state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Run engine
    pub orchestrator: Arc<Orchestrator>,

    /// Realtime hub the SSE endpoints attach to
    pub hub: Arc<RealtimeHub>,

    /// Database pool, absent when running in memory
    pub db_pool: Option<DbPool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Orchestrator, hub: Arc<RealtimeHub>) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            hub,
            db_pool: None,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_db_pool(mut self, pool: DbPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    pub fn stack(&self) -> &Stack {
        self.orchestrator.stack()
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
