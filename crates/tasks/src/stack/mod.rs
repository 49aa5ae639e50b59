//! Capability interfaces of the shared infrastructure a run executes against.
//!
//! Every collaborator is tenant-scoped by argument rather than by instance so
//! one [`Stack`] serves all tenants of a process.

pub mod document;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StackError;
use crate::lock::LockSettings;
use crate::tokens::TokenIssuer;

/// Tenant-scoped JSON document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// First document matching an equality filter.
    async fn find_one(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, StackError>;

    /// Run a query pipeline over a collection.
    async fn query(
        &self,
        tenant_id: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, StackError>;

    /// Merge `fields` into the matching document, inserting
    /// `filter + fields` when none matches. Returns the document after.
    async fn upsert(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
        fields: Value,
    ) -> Result<Value, StackError>;

    /// Replace the matching document wholesale, inserting when none matches.
    async fn replace(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
        document: Value,
    ) -> Result<Value, StackError>;

    /// Delete the first matching document. Returns whether one was deleted.
    async fn delete_one(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<bool, StackError>;
}

/// Key/value cache with TTLs and counters.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StackError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StackError>;

    /// Decrement an integer value, returning the new value.
    ///
    /// A missing key counts as 0.
    async fn decr(&self, key: &str) -> Result<i64, StackError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StackError>;
}

/// A held lease on a resource key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

/// Time-bounded exclusive leases.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try once to acquire `key`; `None` when another holder owns it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StackError>;

    /// Extend a held lease.
    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<(), StackError>;

    /// Release a held lease; releasing an expired lease is not an error.
    async fn release(&self, lease: &Lease) -> Result<(), StackError>;
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
}

/// Where a broker message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Point-to-point queue.
    Queue(String),
    /// Named exchange with optional routing key.
    Exchange {
        name: String,
        kind: ExchangeKind,
        routing_key: Option<String>,
    },
}

/// Per-tenant queue consumed by the deferred-task workers.
pub fn execution_queue(tenant_id: &str) -> Destination {
    Destination::Queue(format!("executions.{}", tenant_id))
}

/// Per-tenant fanout exchange for broadcast deferred tasks.
pub fn execution_exchange(tenant_id: &str) -> Destination {
    Destination::Exchange {
        name: format!("executions.{}", tenant_id),
        kind: ExchangeKind::Fanout,
        routing_key: None,
    }
}

/// Per-tenant dead-letter queue for poison deferred tasks.
pub fn execution_dead_letter_queue(tenant_id: &str) -> Destination {
    Destination::Queue(format!("executions-errors.{}", tenant_id))
}

/// Message broker publish side.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, destination: &Destination, payload: &[u8]) -> Result<(), StackError>;
}

/// Realtime event channel.
#[async_trait]
pub trait Realtime: Send + Sync {
    /// Whether a namespace has been prepared.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StackError>;

    /// Prepare a namespace for `tenant_id`; idempotent.
    async fn ensure_namespace(&self, tenant_id: &str, namespace: &str) -> Result<(), StackError>;

    /// Emit to one room, or to the whole namespace when `room` is `None`.
    async fn emit(
        &self,
        namespace: &str,
        room: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<(), StackError>;
}

/// Process-wide settings handed to task functions.
#[derive(Debug, Clone)]
pub struct StackSettings {
    /// Base URL realtime clients connect to.
    pub public_url: String,
    pub lock: LockSettings,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:8080".to_string(),
            lock: LockSettings::default(),
        }
    }
}

/// The collaborators a run executes against.
#[derive(Clone)]
pub struct Stack {
    pub store: Arc<dyn DocumentStore>,
    pub cache: Arc<dyn Cache>,
    pub locks: Arc<dyn LockService>,
    pub broker: Arc<dyn Broker>,
    pub realtime: Arc<dyn Realtime>,
    pub tokens: TokenIssuer,
    pub settings: StackSettings,
}

impl Stack {
    /// Stack backed entirely by in-process implementations.
    pub fn in_memory() -> Self {
        let cache: Arc<dyn Cache> = Arc::new(memory::MemoryCache::new());
        Self {
            store: Arc::new(memory::MemoryStore::new()),
            cache: cache.clone(),
            locks: Arc::new(memory::MemoryLocks::new()),
            broker: Arc::new(memory::MemoryBroker::new()),
            realtime: Arc::new(memory::MemoryRealtime::new()),
            tokens: TokenIssuer::new(cache, crate::tokens::DEV_SECRET),
            settings: StackSettings::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the cache; the token issuer follows it.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.tokens = self.tokens.with_cache(cache.clone());
        self.cache = cache;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_realtime(mut self, realtime: Arc<dyn Realtime>) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_tokens(mut self, tokens: TokenIssuer) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_settings(mut self, settings: StackSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
