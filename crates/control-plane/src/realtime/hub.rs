//! In-process realtime hub.
//!
//! Namespaces are created on demand and hold connections; each connection
//! carries the rooms its credential allows and the rooms it has joined.
//! Events are pushed into per-connection unbounded channels that the SSE
//! handler drains.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use execustack_tasks::stack::Realtime;
use execustack_tasks::util::normalize_name;
use execustack_tasks::StackError;

/// Event sent to a connection whose join request was refused.
pub const JOIN_ROOM_ERROR: &str = "join_room_error";

/// An event delivered to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event: String,
    pub payload: Value,
}

/// Sending half of a connection's event stream.
pub type EventSender = mpsc::UnboundedSender<RealtimeEvent>;

#[derive(Debug, Error, PartialEq)]
pub enum HubError {
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("rooms not allowed: {}", .0.join(", "))]
    RoomsNotAllowed(Vec<String>),
}

struct Connection {
    sender: EventSender,
    allowed_rooms: HashSet<String>,
    rooms: HashSet<String>,
    connected_at: chrono::DateTime<chrono::Utc>,
}

impl Connection {
    fn send(&self, event: &str, payload: &Value) -> bool {
        self.sender
            .send(RealtimeEvent {
                event: event.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
    }
}

struct Namespace {
    tenant_id: String,
    connections: HashMap<String, Connection>,
}

/// Realtime hub shared by HTTP handlers and the run stack.
#[derive(Clone, Default)]
pub struct RealtimeHub {
    namespaces: Arc<RwLock<HashMap<String, Namespace>>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `namespace` for `tenant_id` if missing.
    pub async fn ensure(&self, tenant_id: &str, namespace: &str) {
        let mut namespaces = self.namespaces.write().await;
        if !namespaces.contains_key(namespace) {
            namespaces.insert(
                namespace.to_string(),
                Namespace {
                    tenant_id: tenant_id.to_string(),
                    connections: HashMap::new(),
                },
            );
            tracing::info!(tenant_id = %tenant_id, namespace = %namespace, "Realtime namespace created");
        }
    }

    pub async fn exists(&self, namespace: &str) -> bool {
        self.namespaces.read().await.contains_key(namespace)
    }

    /// Tenant owning a namespace.
    pub async fn tenant_of(&self, namespace: &str) -> Option<String> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.tenant_id.clone())
    }

    /// Register a connection allowed to join `allowed_rooms`. Returns its id.
    pub async fn connect(
        &self,
        tenant_id: &str,
        namespace: &str,
        allowed_rooms: Vec<String>,
        sender: EventSender,
    ) -> String {
        self.ensure(tenant_id, namespace).await;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let connection = Connection {
            sender,
            allowed_rooms: allowed_rooms.iter().map(|r| normalize_name(r)).collect(),
            rooms: HashSet::new(),
            connected_at: chrono::Utc::now(),
        };

        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.connections.insert(connection_id.clone(), connection);
        }
        tracing::info!(namespace = %namespace, connection_id = %connection_id, "Realtime connection registered");
        connection_id
    }

    /// Remove a connection.
    pub async fn disconnect(&self, namespace: &str, connection_id: &str) {
        let mut namespaces = self.namespaces.write().await;
        if let Some(connection) = namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.connections.remove(connection_id))
        {
            let connected_for = chrono::Utc::now() - connection.connected_at;
            tracing::info!(
                namespace = %namespace,
                connection_id = %connection_id,
                connected_secs = connected_for.num_seconds(),
                "Realtime connection closed"
            );
        }
    }

    /// Join rooms; all of them must be allowed or none is joined and the
    /// connection receives a [`JOIN_ROOM_ERROR`] event.
    pub async fn join_rooms(
        &self,
        namespace: &str,
        connection_id: &str,
        rooms: &[String],
    ) -> Result<Vec<String>, HubError> {
        let mut namespaces = self.namespaces.write().await;
        let connection = namespaces
            .get_mut(namespace)
            .ok_or_else(|| HubError::UnknownNamespace(namespace.to_string()))?
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.to_string()))?;

        let rooms: Vec<String> = rooms.iter().map(|r| normalize_name(r)).collect();
        let refused: Vec<String> = rooms
            .iter()
            .filter(|r| !connection.allowed_rooms.contains(*r))
            .cloned()
            .collect();
        if !refused.is_empty() {
            connection.send(JOIN_ROOM_ERROR, &serde_json::json!({ "rooms": refused }));
            return Err(HubError::RoomsNotAllowed(refused));
        }

        connection.rooms.extend(rooms.iter().cloned());
        tracing::debug!(namespace = %namespace, connection_id = %connection_id, ?rooms, "Joined rooms");
        Ok(rooms)
    }

    /// Leave rooms; rooms not joined are ignored.
    pub async fn leave_rooms(
        &self,
        namespace: &str,
        connection_id: &str,
        rooms: &[String],
    ) -> Result<(), HubError> {
        let mut namespaces = self.namespaces.write().await;
        let connection = namespaces
            .get_mut(namespace)
            .ok_or_else(|| HubError::UnknownNamespace(namespace.to_string()))?
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.to_string()))?;

        for room in rooms {
            connection.rooms.remove(&normalize_name(room));
        }
        Ok(())
    }

    /// Push an event to one room, or every connection when `room` is `None`.
    /// Returns the number of connections reached.
    pub async fn send(&self, namespace: &str, room: Option<&str>, event: &str, payload: &Value) -> usize {
        let namespaces = self.namespaces.read().await;
        let Some(ns) = namespaces.get(namespace) else {
            return 0;
        };

        ns.connections
            .values()
            .filter(|c| room.map(|r| c.rooms.contains(r)).unwrap_or(true))
            .filter(|c| c.send(event, payload))
            .count()
    }

    pub async fn connection_count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.connections.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Realtime for RealtimeHub {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StackError> {
        Ok(self.exists(namespace).await)
    }

    async fn ensure_namespace(&self, tenant_id: &str, namespace: &str) -> Result<(), StackError> {
        self.ensure(tenant_id, namespace).await;
        Ok(())
    }

    async fn emit(
        &self,
        namespace: &str,
        room: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<(), StackError> {
        let reached = self.send(namespace, room, event, payload).await;
        tracing::debug!(namespace = %namespace, ?room, event = %event, reached, "Realtime event emitted");
        Ok(())
    }
}
