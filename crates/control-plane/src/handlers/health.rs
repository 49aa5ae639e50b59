//! Health check endpoints for the ExecuStack Control Plane API.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::db::health_check as db_health_check;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Health status ("ok")
    pub status: String,
}

/// Detailed health check response for the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    pub status: String,

    /// Database status ("healthy", "unhealthy" or "in_memory")
    pub database: String,

    /// Round-trip of the database ping when it succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_latency_ms: Option<f64>,

    /// NATS status ("configured" or "not_configured")
    pub nats: String,

    pub uptime_seconds: u64,

    pub version: String,
}

/// Basic health check endpoint.
///
/// `GET /health`
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// Detailed API health check endpoint.
///
/// `GET /api/health`
pub async fn api_health(State(state): State<AppState>) -> Json<ApiHealthResponse> {
    let (database, database_latency_ms) = match &state.db_pool {
        Some(pool) => match db_health_check(pool).await {
            Ok(latency) => ("healthy", Some(latency.as_secs_f64() * 1000.0)),
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                ("unhealthy", None)
            }
        },
        None => ("in_memory", None),
    };
    let nats = if state.config.nats_url.is_some() {
        "configured"
    } else {
        "not_configured"
    };

    Json(ApiHealthResponse {
        status: "ok".to_string(),
        database: database.to_string(),
        database_latency_ms,
        nats: nats.to_string(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
