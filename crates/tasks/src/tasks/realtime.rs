//! Realtime namespace preparation and event emission.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::require_str;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};
use crate::util::normalize_name;

/// Tenant-scoped namespace path: `/<tenant>/<normalised name>`.
pub fn namespace_path(tenant_id: &str, name: &str) -> String {
    format!("/{}/{}", tenant_id, normalize_name(name))
}

/// Normalised room names from an optional `rooms` array param.
fn rooms_param(task: &TaskDefinition) -> Result<Option<Vec<String>>, TaskError> {
    let Some(rooms) = task.param("rooms") else {
        return Ok(None);
    };
    let rooms = rooms.as_array().ok_or(TaskError::InvalidDefinition)?;
    rooms
        .iter()
        .map(|r| r.as_str().map(normalize_name).ok_or(TaskError::InvalidDefinition))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// `ws_emit_event`: emits `event` with `payload` to each room of a namespace.
///
/// An empty room name targets the whole namespace and a missing `namespace`
/// means the tenant root. Nothing is sent when the namespace has not been
/// prepared or no rooms are given.
pub struct EmitEventTask;

#[async_trait]
impl TaskFunction for EmitEventTask {
    fn name(&self) -> &'static str {
        "ws_emit_event"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let namespace = namespace_path(scope.tenant_id, task.param_str("namespace").unwrap_or(""));
        let event = require_str(task, "event")?;
        let payload = task.param("payload").cloned().unwrap_or(Value::Null);
        let rooms = rooms_param(task)?.unwrap_or_default();

        let realtime = scope.stack.realtime.as_ref();
        let mut emitted = 0;
        if realtime.namespace_exists(&namespace).await? {
            for room in &rooms {
                let room = Some(room.as_str()).filter(|r| !r.is_empty());
                realtime.emit(&namespace, room, event, &payload).await?;
                emitted += 1;
            }
        } else {
            debug!(%namespace, %event, "Namespace not prepared, skipping emit");
        }

        results.insert("emitted".to_string(), json!(emitted));
        metrics.mark_success();
        Ok(())
    }
}

/// `ws_prep_namespace`: prepares a tenant namespace and issues the credential
/// clients connect with.
pub struct PrepNamespaceTask;

#[async_trait]
impl TaskFunction for PrepNamespaceTask {
    fn name(&self) -> &'static str {
        "ws_prep_namespace"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let name = normalize_name(require_str(task, "namespace")?);
        if name.is_empty() {
            return Err(TaskError::InvalidDefinition);
        }
        let path = namespace_path(scope.tenant_id, &name);

        scope
            .stack
            .realtime
            .ensure_namespace(scope.tenant_id, &path)
            .await?;

        let mut claims = Map::new();
        claims.insert("namespace".to_string(), json!(name));
        if let Some(rooms) = rooms_param(task)? {
            claims.insert("rooms".to_string(), json!(rooms));
        }
        let token = scope
            .stack
            .tokens
            .issue(scope.tenant_id, Value::Object(claims), None, None)
            .await?;

        let base = scope.stack.settings.public_url.trim_end_matches('/');
        results.insert("url".to_string(), json!(format!("{}{}", base, path)));
        results.insert("client_id".to_string(), json!(scope.tenant_id));
        results.insert("token".to_string(), json!(token));
        metrics.mark_success();
        Ok(())
    }
}
