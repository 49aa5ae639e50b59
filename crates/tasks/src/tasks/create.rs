//! Document creation.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{into_object, require_id_in, require_str};
use crate::compensation::CompensationAction;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};
use crate::util::generate_document_id;
use crate::versioning::{timestamp, FIELD_CREATED_AT, FIELD_DERIVED_FROM, FIELD_ID, FIELD_UPDATED_AT, FIELD_VERSION};

/// `db_create_doc`: inserts `payload` into `collection_name` at version 1.
pub struct CreateDocTask;

#[async_trait]
impl TaskFunction for CreateDocTask {
    fn name(&self) -> &'static str {
        "db_create_doc"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let collection = require_str(task, "collection_name")?;
        let mut document = into_object(task.param("payload").cloned().unwrap_or(Value::Null))?;
        let store = scope.stack.store.as_ref();

        let id = match document.get(FIELD_ID).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {
                require_id_in(id, collection)?;
                let id = id.to_string();
                if store
                    .find_one(scope.tenant_id, collection, &json!({ FIELD_ID: id }))
                    .await?
                    .is_some()
                {
                    return Err(TaskError::DocumentExists);
                }
                id
            }
            _ => generate_document_id(store, scope.tenant_id, collection).await?,
        };

        let now = timestamp();
        document.insert(FIELD_ID.to_string(), json!(id));
        document.insert(FIELD_VERSION.to_string(), json!(1));
        document.insert(FIELD_DERIVED_FROM.to_string(), json!(0));
        document.insert(FIELD_CREATED_AT.to_string(), now.clone());
        document.insert(FIELD_UPDATED_AT.to_string(), now);

        let created = store
            .upsert(scope.tenant_id, collection, &json!({ FIELD_ID: id }), Value::Object(document))
            .await?;

        scope.compensate(CompensationAction::DeleteDocument {
            collection: collection.to_string(),
            id: id.clone(),
        });
        tracing::debug!(%id, collection, "Created document");

        results.insert("document".to_string(), created);
        metrics.mark_success();
        Ok(())
    }
}
