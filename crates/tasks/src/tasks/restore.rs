//! Restore a deleted document from its latest version record.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{into_object, require_str};
use crate::compensation::CompensationAction;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::lock::{lock_key, with_lock};
use crate::registry::{TaskFunction, TaskScope};
use crate::versioning::{stamp, DocumentState, FIELD_ID};

/// `db_restore_doc`: recreates deleted document `id` from its newest record.
pub struct RestoreDocTask;

#[async_trait]
impl TaskFunction for RestoreDocTask {
    fn name(&self) -> &'static str {
        "db_restore_doc"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let id = require_str(task, "id")?;

        let stack = scope.stack;
        let tenant_id = scope.tenant_id;
        with_lock(&stack.locks, &stack.settings.lock, lock_key(tenant_id, id), async {
            let store = stack.store.as_ref();
            let state = DocumentState::load(store, tenant_id, id).await?;
            let record = state.latest_record.clone().ok_or(TaskError::VersionNotFound)?;
            if state.document.is_some() {
                return Err(TaskError::DocumentExists);
            }

            let mut document = into_object(record.document)?;
            document.insert(FIELD_ID.to_string(), json!(id));
            stamp(&mut document, record.version + 1, record.version);

            let restored = store
                .replace(tenant_id, &state.collection, &json!({ FIELD_ID: id }), Value::Object(document))
                .await?;
            scope.compensate(CompensationAction::DeleteDocument {
                collection: state.collection.clone(),
                id: id.to_string(),
            });

            results.insert("document".to_string(), restored);
            metrics.mark_success();
            Ok(())
        })
        .await
    }
}
