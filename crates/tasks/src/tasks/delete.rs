//! Versioned document deletion.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{into_object, require_str};
use crate::compensation::CompensationAction;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::lock::{lock_key, with_lock};
use crate::registry::{TaskFunction, TaskScope};
use crate::versioning::{save_version_record, stamp, version_of, DocumentState, FIELD_ID};

/// `db_delete_doc`: snapshots document `id` as its newest version, then
/// deletes it.
pub struct DeleteDocTask;

#[async_trait]
impl TaskFunction for DeleteDocTask {
    fn name(&self) -> &'static str {
        "db_delete_doc"
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
            let current = state.require_document()?.clone();
            let filter = json!({ FIELD_ID: id });

            // A record already covers this version: promote the live document
            // past it so the snapshot below is a new version.
            let latest = if state.is_document_latest() {
                current.clone()
            } else {
                let mut promoted = into_object(current.clone())?;
                stamp(&mut promoted, state.next_version(), version_of(&current));
                let promoted = store
                    .replace(tenant_id, &state.collection, &filter, Value::Object(promoted))
                    .await?;
                scope.compensate(CompensationAction::RestoreDocument {
                    collection: state.collection.clone(),
                    id: id.to_string(),
                    snapshot: current.clone(),
                });
                promoted
            };

            let record = save_version_record(store, tenant_id, scope.run_id, &latest).await?;
            scope.compensate(CompensationAction::DeleteVersionRecord {
                document_id: id.to_string(),
                version: record.version,
            });

            store.delete_one(tenant_id, &state.collection, &filter).await?;
            scope.compensate(CompensationAction::RecreateDocument {
                collection: state.collection.clone(),
                id: id.to_string(),
                snapshot: latest,
            });

            results.insert("is_document_deleted".to_string(), json!(true));
            results.insert("document".to_string(), json!({ FIELD_ID: id }));
            metrics.mark_success();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;
    use crate::tasks::test_support::{run, unwind, TENANT};
    use crate::versioning::{latest_record, save_version_record};

    async fn seed(stack: &Stack, version: u64) -> Value {
        stack
            .store
            .replace(
                TENANT,
                "users",
                &json!({ "id": "users~1" }),
                json!({ "name": "a", "version": version, "derived_from_version": version - 1 }),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_snapshots_latest() {
        let stack = Stack::in_memory();
        seed(&stack, 1).await;

        let out = run(&DeleteDocTask, &stack, json!({ "id": "users~1" })).await;
        out.result.unwrap();
        assert_eq!(out.results["is_document_deleted"], json!(true));
        assert_eq!(out.results["document"], json!({ "id": "users~1" }));

        let live = stack.store.find_one(TENANT, "users", &json!({ "id": "users~1" })).await.unwrap();
        assert!(live.is_none());
        let record = latest_record(stack.store.as_ref(), TENANT, "users~1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.document["name"], json!("a"));
    }

    #[tokio::test]
    async fn test_delete_promotes_when_recorded() {
        let stack = Stack::in_memory();
        let doc = seed(&stack, 2).await;
        save_version_record(stack.store.as_ref(), TENANT, "earlier", &doc).await.unwrap();

        let out = run(&DeleteDocTask, &stack, json!({ "id": "users~1" })).await;
        out.result.unwrap();
        assert_eq!(out.compensations.len(), 3);

        let record = latest_record(stack.store.as_ref(), TENANT, "users~1").await.unwrap().unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.derived_from_version, 2);
        assert_eq!(record.document["name"], json!("a"));
    }

    #[tokio::test]
    async fn test_compensation_recreates_original() {
        let stack = Stack::in_memory();
        let doc = seed(&stack, 2).await;
        save_version_record(stack.store.as_ref(), TENANT, "earlier", &doc).await.unwrap();

        let out = run(&DeleteDocTask, &stack, json!({ "id": "users~1" })).await;
        unwind(&stack, &out.compensations).await;

        let live = stack
            .store
            .find_one(TENANT, "users", &json!({ "id": "users~1" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live, doc);
        let record = latest_record(stack.store.as_ref(), TENANT, "users~1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_delete_missing_document() {
        let stack = Stack::in_memory();
        let out = run(&DeleteDocTask, &stack, json!({ "id": "users~1" })).await;
        assert!(matches!(out.result, Err(TaskError::DocumentNotFound)));
    }
}
