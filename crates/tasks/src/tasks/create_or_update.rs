//! Create a document, or update it when it already exists.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_id_in, require_str, CreateDocTask, UpdateDocTask};
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};
use crate::versioning::FIELD_ID;

/// `db_create_or_update_doc`: looks up `id` in `collection_name` and
/// delegates to `db_update_doc` or `db_create_doc`.
pub struct CreateOrUpdateDocTask;

#[async_trait]
impl TaskFunction for CreateOrUpdateDocTask {
    fn name(&self) -> &'static str {
        "db_create_or_update_doc"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let collection = require_str(task, "collection_name")?;
        let id = require_str(task, "id")?;
        require_id_in(id, collection)?;
        let payload = task
            .param("payload")
            .filter(|p| p.is_object())
            .cloned()
            .ok_or(TaskError::InvalidDefinition)?;

        let existing = scope
            .stack
            .store
            .find_one(scope.tenant_id, collection, &json!({ FIELD_ID: id }))
            .await?;

        let mut delegated = task.clone();
        if existing.is_some() {
            delegated.params = json!({ "id": id, "payload": payload });
            UpdateDocTask.execute(&delegated, metrics, results, scope).await
        } else {
            let mut payload = payload;
            if let Value::Object(map) = &mut payload {
                map.insert(FIELD_ID.to_string(), json!(id));
            }
            delegated.params = json!({ "collection_name": collection, "payload": payload });
            CreateDocTask.execute(&delegated, metrics, results, scope).await
        }
    }
}
