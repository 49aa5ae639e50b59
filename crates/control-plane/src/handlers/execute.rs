//! Run execution endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use tracing::{debug, info};

use execustack_tasks::{ExecutionContext, ExecutionDefinition};

use crate::clients::find_by_api_key;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// API key from an `Authorization: Bearer <key>` header.
pub fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Run an execution definition for the calling client.
///
/// POST /api/execute
///
/// Responds with the finished run context: `200` when the run succeeded,
/// `422` when it failed.
pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<ExecutionContext>)> {
    let api_key = bearer_key(&headers).ok_or_else(|| AppError::Auth("missing API key".to_string()))?;
    let client = find_by_api_key(state.stack(), &state.config.admin_client_id, api_key)
        .await?
        .ok_or_else(|| AppError::Auth("Invalid API key".to_string()))?;

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::BadRequest("no execution_definition".to_string()));
    }
    let definition: ExecutionDefinition = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid execution_definition: {}", e)))?;

    debug!(
        client_id = %client.client_id,
        tasks = definition.tasks_definitions.len(),
        "Execution requested"
    );
    let ctx = state.orchestrator.execute(&client.client_id, definition).await;

    let status = if ctx.execution_metrics.is_success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    info!(client_id = %client.client_id, run_id = %ctx.run_id, status = status.as_u16(), "Execution finished");

    Ok((status, Json(ctx)))
}
