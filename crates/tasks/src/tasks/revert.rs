//! Revert a document to a recorded version.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{into_object, require_str};
use crate::compensation::CompensationAction;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::lock::{lock_key, with_lock};
use crate::registry::{TaskFunction, TaskScope};
use crate::versioning::{find_record, save_version_record, stamp, DocumentState, FIELD_ID};

/// `db_revert_doc`: overwrites document `id` with the payload of `version`.
///
/// The reverted state becomes a new version derived from `version`.
pub struct RevertDocTask;

#[async_trait]
impl TaskFunction for RevertDocTask {
    fn name(&self) -> &'static str {
        "db_revert_doc"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let id = require_str(task, "id")?;
        let version = task
            .param("version")
            .and_then(Value::as_u64)
            .ok_or(TaskError::InvalidDefinition)?;

        let stack = scope.stack;
        let tenant_id = scope.tenant_id;
        with_lock(&stack.locks, &stack.settings.lock, lock_key(tenant_id, id), async {
            let store = stack.store.as_ref();
            let state = DocumentState::load(store, tenant_id, id).await?;
            let current = state.require_document()?.clone();
            let target = find_record(store, tenant_id, id, version)
                .await?
                .ok_or(TaskError::VersionNotFound)?;

            if state.is_document_latest() {
                let record = save_version_record(store, tenant_id, scope.run_id, &current).await?;
                scope.compensate(CompensationAction::DeleteVersionRecord {
                    document_id: id.to_string(),
                    version: record.version,
                });
            }

            let mut document = into_object(target.document)?;
            document.insert(FIELD_ID.to_string(), json!(id));
            stamp(&mut document, state.next_version(), target.version);

            let reverted = store
                .replace(tenant_id, &state.collection, &json!({ FIELD_ID: id }), Value::Object(document))
                .await?;
            scope.compensate(CompensationAction::RestoreDocument {
                collection: state.collection.clone(),
                id: id.to_string(),
                snapshot: current,
            });

            results.insert("document".to_string(), reverted);
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
    use crate::tasks::UpdateDocTask;

    async fn seed_history(stack: &Stack) {
        stack
            .store
            .replace(
                TENANT,
                "users",
                &json!({ "id": "users~1" }),
                json!({ "name": "v1", "version": 1, "derived_from_version": 0 }),
            )
            .await
            .unwrap();
        run(&UpdateDocTask, stack, json!({ "id": "users~1", "payload": { "name": "v2" } }))
            .await
            .result
            .unwrap();
    }

    #[tokio::test]
    async fn test_revert_restores_target_payload() {
        let stack = Stack::in_memory();
        seed_history(&stack).await;

        let out = run(&RevertDocTask, &stack, json!({ "id": "users~1", "version": 1 })).await;
        out.result.unwrap();

        let doc = &out.results["document"];
        assert_eq!(doc["name"], json!("v1"));
        assert_eq!(doc["version"], json!(3));
        assert_eq!(doc["derived_from_version"], json!(1));

        // the pre-revert state (v2) was snapshotted
        let v2 = find_record(stack.store.as_ref(), TENANT, "users~1", 2).await.unwrap().unwrap();
        assert_eq!(v2.document["name"], json!("v2"));
    }

    #[tokio::test]
    async fn test_revert_to_missing_version() {
        let stack = Stack::in_memory();
        seed_history(&stack).await;

        let out = run(&RevertDocTask, &stack, json!({ "id": "users~1", "version": 7 })).await;
        assert!(matches!(out.result, Err(TaskError::VersionNotFound)));
        assert!(out.compensations.is_empty());
    }

    #[tokio::test]
    async fn test_revert_requires_version_param() {
        let stack = Stack::in_memory();
        let out = run(&RevertDocTask, &stack, json!({ "id": "users~1" })).await;
        assert!(matches!(out.result, Err(TaskError::InvalidDefinition)));
    }

    #[tokio::test]
    async fn test_compensation_restores_prior_document() {
        let stack = Stack::in_memory();
        seed_history(&stack).await;

        let out = run(&RevertDocTask, &stack, json!({ "id": "users~1", "version": 1 })).await;
        unwind(&stack, &out.compensations).await;

        let doc = stack
            .store
            .find_one(TENANT, "users", &json!({ "id": "users~1" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["name"], json!("v2"));
        assert_eq!(doc["version"], json!(2));
        assert!(find_record(stack.store.as_ref(), TENANT, "users~1", 2).await.unwrap().is_none());
    }
}
