//! ExecuStack Control Plane Library
//!
//! This crate provides the control plane server for ExecuStack, handling:
//!
//! - **Run Orchestration**: Order, evaluate and execute task definitions with
//!   LIFO compensation on failure
//! - **Storage Adapters**: PostgreSQL-backed document store, cache and locks
//! - **Messaging**: NATS-backed broker for deferred tasks and result fanout
//! - **Realtime**: Namespaces, rooms and SSE event streams
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: PostgreSQL collaborators and schema
//! - [`engine`]: The orchestrator, deferred dispatch and run records
//! - [`error`]: Custom error types with Axum integration
//! - [`handlers`]: HTTP route handlers
//! - [`state`]: Shared application state
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use execustack_control_plane::{
//!     bootstrap::build_stack, config::AppConfig, engine::Orchestrator,
//!     realtime::RealtimeHub, routes::build_router, state::AppState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let hub = Arc::new(RealtimeHub::new());
//!     let stack = build_stack(&config, None, None, hub.clone()).await;
//!     let registry = Arc::new(execustack_tasks::create_default_registry());
//!     let state = AppState::new(config, Orchestrator::new(registry, stack), hub);
//!     let app = build_router(state);
//!     // ... serve
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod clients;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod nats;
pub mod realtime;
pub mod result_ext;
pub mod routes;
pub mod state;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
