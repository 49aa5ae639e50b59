//! Realtime relay over NATS.
//!
//! Worker processes have no connected clients; their realtime calls are
//! published to `es.realtime.<tenant>` and replayed into the control plane's
//! hub by [`spawn_relay`].

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use execustack_tasks::stack::Realtime;
use execustack_tasks::StackError;

use crate::realtime::RealtimeHub;
use crate::result_ext::ResultExt;

/// Subject prefix of relayed realtime calls.
pub const RELAY_PREFIX: &str = "es.realtime";

/// A realtime call forwarded to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Ensure {
        tenant_id: String,
        namespace: String,
    },
    Emit {
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        event: String,
        payload: Value,
    },
}

pub fn relay_subject(tenant_id: &str) -> String {
    format!("{}.{}", RELAY_PREFIX, tenant_id)
}

/// Tenant segment of a `/<tenant>/<name>` namespace.
pub fn namespace_tenant(namespace: &str) -> Option<&str> {
    namespace
        .strip_prefix('/')
        .and_then(|rest| rest.split('/').next())
        .filter(|tenant| !tenant.is_empty())
}

/// Realtime channel that forwards every call over NATS.
#[derive(Clone)]
pub struct NatsRealtime {
    client: async_nats::Client,
}

impl NatsRealtime {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    async fn forward(&self, tenant_id: &str, message: &RelayMessage) -> Result<(), StackError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| StackError::Realtime(e.to_string()))?;
        self.client
            .publish(relay_subject(tenant_id), payload.into())
            .await
            .map_err(|e| StackError::Realtime(e.to_string()))
    }
}

#[async_trait]
impl Realtime for NatsRealtime {
    /// Always true: the receiving hub creates namespaces on demand.
    async fn namespace_exists(&self, _namespace: &str) -> Result<bool, StackError> {
        Ok(true)
    }

    async fn ensure_namespace(&self, tenant_id: &str, namespace: &str) -> Result<(), StackError> {
        let message = RelayMessage::Ensure {
            tenant_id: tenant_id.to_string(),
            namespace: namespace.to_string(),
        };
        self.forward(tenant_id, &message).await
    }

    async fn emit(
        &self,
        namespace: &str,
        room: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<(), StackError> {
        let tenant_id = namespace_tenant(namespace)
            .ok_or_else(|| StackError::Realtime(format!("invalid namespace: {}", namespace)))?;
        let message = RelayMessage::Emit {
            namespace: namespace.to_string(),
            room: room.map(str::to_string),
            event: event.to_string(),
            payload: payload.clone(),
        };
        self.forward(tenant_id, &message).await
    }
}

/// Apply one relayed message to the hub.
pub async fn apply(hub: &RealtimeHub, payload: &[u8]) -> Result<(), StackError> {
    let message: RelayMessage =
        serde_json::from_slice(payload).map_err(|e| StackError::Realtime(e.to_string()))?;
    match message {
        RelayMessage::Ensure {
            tenant_id,
            namespace,
        } => hub.ensure_namespace(&tenant_id, &namespace).await,
        RelayMessage::Emit {
            namespace,
            room,
            event,
            payload,
        } => {
            hub.ensure(namespace_tenant(&namespace).unwrap_or_default(), &namespace)
                .await;
            hub.emit(&namespace, room.as_deref(), &event, &payload).await
        }
    }
}

/// Subscribe to relayed realtime calls and replay them into `hub`.
pub fn spawn_relay(client: async_nats::Client, hub: Arc<RealtimeHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscriber = match client.subscribe(format!("{}.*", RELAY_PREFIX)).await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe to realtime relay");
                return;
            }
        };
        tracing::info!(subject = %format!("{}.*", RELAY_PREFIX), "Realtime relay started");

        while let Some(message) = subscriber.next().await {
            let _ = apply(&hub, &message.payload)
                .await
                .log(format!("relaying realtime message on {}", message.subject));
        }
        tracing::warn!("Realtime relay subscription closed");
    })
}
