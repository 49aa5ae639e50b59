//! Compensating actions registered by tasks and replayed on run failure.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StackError;
use crate::stack::Stack;
use crate::versioning::VERSIONS_COLLECTION;

/// A compensation registered by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub task_name: String,
    pub action: CompensationAction,
}

/// Reverse action undoing one side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompensationAction {
    /// Mark the task reverted and clear its results (run-context only).
    MarkReverted,

    /// Delete a document created by the task.
    DeleteDocument { collection: String, id: String },

    /// Replace the live document with its pre-mutation snapshot.
    RestoreDocument {
        collection: String,
        id: String,
        snapshot: Value,
    },

    /// Recreate a document deleted by the task.
    RecreateDocument {
        collection: String,
        id: String,
        snapshot: Value,
    },

    /// Remove a version record saved by the task.
    DeleteVersionRecord { document_id: String, version: u64 },
}

impl CompensationAction {
    /// Whether replaying this action touches the stack.
    pub fn touches_store(&self) -> bool {
        !matches!(self, CompensationAction::MarkReverted)
    }
}

impl Compensation {
    /// Apply the store-side part of the compensation.
    ///
    /// `MarkReverted` has no store effect; the orchestrator applies it to the
    /// run context.
    pub async fn apply(&self, tenant_id: &str, stack: &Stack) -> Result<(), StackError> {
        match &self.action {
            CompensationAction::MarkReverted => Ok(()),
            CompensationAction::DeleteDocument { collection, id } => {
                stack
                    .store
                    .delete_one(tenant_id, collection, &json!({ "id": id }))
                    .await?;
                Ok(())
            }
            CompensationAction::RestoreDocument {
                collection,
                id,
                snapshot,
            }
            | CompensationAction::RecreateDocument {
                collection,
                id,
                snapshot,
            } => {
                stack
                    .store
                    .replace(tenant_id, collection, &json!({ "id": id }), snapshot.clone())
                    .await?;
                Ok(())
            }
            CompensationAction::DeleteVersionRecord {
                document_id,
                version,
            } => {
                stack
                    .store
                    .delete_one(
                        tenant_id,
                        VERSIONS_COLLECTION,
                        &json!({ "document_id": document_id, "version": version }),
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensation_serialization() {
        let comp = Compensation {
            task_name: "create".to_string(),
            action: CompensationAction::DeleteDocument {
                collection: "users".to_string(),
                id: "users~1".to_string(),
            },
        };
        let value = serde_json::to_value(&comp).unwrap();
        assert_eq!(
            value,
            json!({
                "task_name": "create",
                "action": { "type": "delete_document", "collection": "users", "id": "users~1" }
            })
        );
        let back: Compensation = serde_json::from_value(value).unwrap();
        assert_eq!(back, comp);
    }

    #[tokio::test]
    async fn test_restore_document_replaces_state() {
        let stack = Stack::in_memory();
        let filter = json!({ "id": "users~1" });
        stack
            .store
            .replace("acme", "users", &filter, json!({ "id": "users~1", "name": "new", "extra": 1 }))
            .await
            .unwrap();

        let comp = Compensation {
            task_name: "update".to_string(),
            action: CompensationAction::RestoreDocument {
                collection: "users".to_string(),
                id: "users~1".to_string(),
                snapshot: json!({ "id": "users~1", "name": "old" }),
            },
        };
        comp.apply("acme", &stack).await.unwrap();

        let doc = stack.store.find_one("acme", "users", &filter).await.unwrap().unwrap();
        assert_eq!(doc, json!({ "id": "users~1", "name": "old" }));
    }

    #[tokio::test]
    async fn test_delete_version_record() {
        let stack = Stack::in_memory();
        let record = json!({ "id": "es-versions~1", "document_id": "users~1", "version": 2 });
        stack
            .store
            .replace("acme", VERSIONS_COLLECTION, &json!({ "id": "es-versions~1" }), record)
            .await
            .unwrap();

        let comp = Compensation {
            task_name: "update".to_string(),
            action: CompensationAction::DeleteVersionRecord {
                document_id: "users~1".to_string(),
                version: 2,
            },
        };
        comp.apply("acme", &stack).await.unwrap();

        let left = stack
            .store
            .find_one("acme", VERSIONS_COLLECTION, &json!({ "document_id": "users~1" }))
            .await
            .unwrap();
        assert!(left.is_none());
    }
}
