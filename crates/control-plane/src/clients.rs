//! Client registry kept in the admin tenant's `clients` collection.
//!
//! A client document is `{id, api_key_hash, settings: {client_id, name, ...}}`;
//! `settings.client_id` is the tenant id its API key runs as.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use execustack_tasks::util::sha256_hex;
use execustack_tasks::{ExecutionDefinition, Stack};

use crate::engine::Orchestrator;
use crate::error::{AppError, AppResult};

pub const CLIENTS_COLLECTION: &str = "clients";

/// Display name of the bootstrap client.
pub const ADMIN_CLIENT_NAME: &str = "ExecuStack Admin Client";

/// Settings of a registered client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub client_id: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resolve an API key to its client's settings.
pub async fn find_by_api_key(
    stack: &Stack,
    admin_client_id: &str,
    api_key: &str,
) -> AppResult<Option<ClientSettings>> {
    let filter = json!({ "api_key_hash": sha256_hex(api_key) });
    let Some(document) = stack
        .store
        .find_one(admin_client_id, CLIENTS_COLLECTION, &filter)
        .await?
    else {
        return Ok(None);
    };

    let settings = document
        .get("settings")
        .cloned()
        .ok_or_else(|| AppError::Internal("client document has no settings".to_string()))?;
    Ok(Some(serde_json::from_value(settings)?))
}

/// Make sure the admin client exists with the configured API key.
///
/// Creation and key rotation both go through engine runs so they are
/// versioned like any other document change.
pub async fn ensure_admin_client(
    orchestrator: &Orchestrator,
    admin_client_id: &str,
    api_key: &str,
) -> anyhow::Result<()> {
    let api_key_hash = sha256_hex(api_key);
    let existing = orchestrator
        .stack()
        .store
        .find_one(
            admin_client_id,
            CLIENTS_COLLECTION,
            &json!({ "settings.client_id": admin_client_id }),
        )
        .await?;

    let tasks = match existing {
        Some(client) if client.get("api_key_hash") == Some(&json!(api_key_hash)) => {
            tracing::info!(client_id = %admin_client_id, "Admin client exists and API key hash matches");
            return Ok(());
        }
        Some(client) => {
            tracing::warn!(client_id = %admin_client_id, "Admin client API key hash does not match, updating");
            let id = client
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("admin client document has no id"))?;
            json!({
                "update_client": {
                    "function": "db_update_doc",
                    "params": { "id": id, "payload": { "api_key_hash": api_key_hash } }
                }
            })
        }
        None => {
            tracing::warn!(client_id = %admin_client_id, "Admin client does not exist, creating");
            json!({
                "create_client": {
                    "function": "db_create_doc",
                    "params": {
                        "collection_name": CLIENTS_COLLECTION,
                        "payload": {
                            "api_key_hash": api_key_hash,
                            "settings": { "client_id": admin_client_id, "name": ADMIN_CLIENT_NAME }
                        }
                    }
                }
            })
        }
    };

    let definition: ExecutionDefinition = serde_json::from_value(json!({ "tasks_definitions": tasks }))?;
    let ctx = orchestrator.execute(admin_client_id, definition).await;
    if !ctx.execution_metrics.is_success {
        anyhow::bail!(
            "failed to bootstrap admin client: {}",
            ctx.execution_metrics.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use execustack_tasks::create_default_registry;
    use std::sync::Arc;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(create_default_registry()), Stack::in_memory())
    }

    #[tokio::test]
    async fn test_bootstrap_creates_admin_client() {
        let orchestrator = orchestrator();
        ensure_admin_client(&orchestrator, "admin", "secret").await.unwrap();

        let settings = find_by_api_key(orchestrator.stack(), "admin", "secret")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings.client_id, "admin");
        assert_eq!(settings.extra["name"], json!(ADMIN_CLIENT_NAME));
        assert!(find_by_api_key(orchestrator.stack(), "admin", "wrong")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_rotates_key_once() {
        let orchestrator = orchestrator();
        ensure_admin_client(&orchestrator, "admin", "old").await.unwrap();
        ensure_admin_client(&orchestrator, "admin", "new").await.unwrap();
        ensure_admin_client(&orchestrator, "admin", "new").await.unwrap();

        let stack = orchestrator.stack();
        assert!(find_by_api_key(stack, "admin", "old").await.unwrap().is_none());
        assert!(find_by_api_key(stack, "admin", "new").await.unwrap().is_some());

        let clients = stack.store.query("admin", CLIENTS_COLLECTION, &[]).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["version"], json!(2));
    }
}
