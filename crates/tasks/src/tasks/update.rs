//! Versioned document update.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use super::{into_object, require_str};
use crate::compensation::CompensationAction;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::lock::{lock_key, with_lock};
use crate::registry::{TaskFunction, TaskScope};
use crate::stack::document::apply_update;
use crate::versioning::{save_version_record, stamp, version_of, DocumentState, FIELD_ID};

/// `db_update_doc`: applies `payload` to document `id` under its lock.
///
/// `payload` is a plain object (`$set`), an operator document, or a
/// pipeline of operator documents.
pub struct UpdateDocTask;

#[async_trait]
impl TaskFunction for UpdateDocTask {
    fn name(&self) -> &'static str {
        "db_update_doc"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let id = require_str(task, "id")?;
        let payload = task
            .param("payload")
            .filter(|p| p.is_object() || p.is_array())
            .ok_or(TaskError::InvalidDefinition)?;

        let stack = scope.stack;
        let tenant_id = scope.tenant_id;
        with_lock(&stack.locks, &stack.settings.lock, lock_key(tenant_id, id), async {
            let store = stack.store.as_ref();
            let state = DocumentState::load(store, tenant_id, id).await?;
            let current = state.require_document()?.clone();

            if state.is_document_latest() {
                let record = save_version_record(store, tenant_id, scope.run_id, &current).await?;
                scope.compensate(CompensationAction::DeleteVersionRecord {
                    document_id: id.to_string(),
                    version: record.version,
                });
            }

            let mut document = into_object(current.clone())?;
            apply_update(&mut document, payload).map_err(|e| {
                warn!(%id, error = %e, "Rejected update payload");
                TaskError::InvalidDefinition
            })?;
            document.insert(FIELD_ID.to_string(), json!(id));
            stamp(&mut document, state.next_version(), version_of(&current));

            let updated = store
                .replace(tenant_id, &state.collection, &json!({ FIELD_ID: id }), Value::Object(document))
                .await?;
            scope.compensate(CompensationAction::RestoreDocument {
                collection: state.collection.clone(),
                id: id.to_string(),
                snapshot: current,
            });

            results.insert("document".to_string(), updated);
            metrics.mark_success();
            Ok(())
        })
        .await
    }
}
