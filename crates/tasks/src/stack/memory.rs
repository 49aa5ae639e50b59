//! In-process collaborators for tests and single-process runs.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::document::{apply_update, matches, run_pipeline, seed_from_filter};
use super::{Broker, Cache, Destination, DocumentStore, Lease, LockService, Realtime};
use crate::error::StackError;

/// Documents held per `(tenant, collection)`.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<(String, String), Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection.
    pub async fn count(&self, tenant_id: &str, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections
            .get(&(tenant_id.to_string(), collection.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn key(tenant_id: &str, collection: &str) -> (String, String) {
    (tenant_id.to_string(), collection.to_string())
}

fn position(docs: &[Value], filter: &Value) -> Result<Option<usize>, StackError> {
    for (i, doc) in docs.iter().enumerate() {
        if matches(doc, filter)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn as_object(value: Value) -> Result<Map<String, Value>, StackError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StackError::Store(format!("document must be an object, got {}", other))),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, StackError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(&key(tenant_id, collection)) else {
            return Ok(None);
        };
        Ok(position(docs, filter)?.map(|i| docs[i].clone()))
    }

    async fn query(
        &self,
        tenant_id: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, StackError> {
        let docs = {
            let collections = self.collections.read().await;
            collections
                .get(&key(tenant_id, collection))
                .cloned()
                .unwrap_or_default()
        };
        run_pipeline(docs, pipeline)
    }

    async fn upsert(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
        fields: Value,
    ) -> Result<Value, StackError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(key(tenant_id, collection)).or_default();
        match position(docs, filter)? {
            Some(i) => {
                let mut doc = as_object(docs[i].clone())?;
                apply_update(&mut doc, &fields)?;
                docs[i] = Value::Object(doc);
                Ok(docs[i].clone())
            }
            None => {
                let mut doc = seed_from_filter(filter);
                apply_update(&mut doc, &fields)?;
                docs.push(Value::Object(doc));
                Ok(docs[docs.len() - 1].clone())
            }
        }
    }

    async fn replace(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
        document: Value,
    ) -> Result<Value, StackError> {
        let mut doc = seed_from_filter(filter);
        doc.extend(as_object(document)?);
        let doc = Value::Object(doc);

        let mut collections = self.collections.write().await;
        let docs = collections.entry(key(tenant_id, collection)).or_default();
        match position(docs, filter)? {
            Some(i) => docs[i] = doc.clone(),
            None => docs.push(doc.clone()),
        }
        Ok(doc)
    }

    async fn delete_one(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<bool, StackError> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&key(tenant_id, collection)) else {
            return Ok(false);
        };
        match position(docs, filter)? {
            Some(i) => {
                docs.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

/// Cache with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StackError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StackError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn decr(&self, key: &str) -> Result<i64, StackError> {
        let mut entries = self.entries.lock().await;
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if entry.is_live() => {
                let n = entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| StackError::Cache(format!("value at {} is not an integer", key)))?;
                (n, entry.expires_at)
            }
            _ => (0, None),
        };
        let next = current - 1;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<bool, StackError> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).map(|e| e.is_live()).unwrap_or(false))
    }
}

/// Lease table keyed by resource.
#[derive(Default)]
pub struct MemoryLocks {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLocks {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StackError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(Lease {
            key: key.to_string(),
            token,
        }))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<(), StackError> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lease.key) {
            Some((token, expires_at)) if *token == lease.token => {
                *expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(StackError::Lock(format!("lease on {} is no longer held", lease.key))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StackError> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&lease.key)
            .map(|(token, _)| *token == lease.token)
            .unwrap_or(false)
        {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}

/// Broker that records every published message.
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<(Destination, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Published messages decoded as JSON.
    pub async fn published(&self) -> Vec<(Destination, Value)> {
        let published = self.published.lock().await;
        published
            .iter()
            .map(|(dest, bytes)| {
                let value = serde_json::from_slice(bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()));
                (dest.clone(), value)
            })
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, destination: &Destination, payload: &[u8]) -> Result<(), StackError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StackError::Broker("broker unavailable".to_string()));
        }
        self.published
            .lock()
            .await
            .push((destination.clone(), payload.to_vec()));
        Ok(())
    }
}

/// An event delivered through [`MemoryRealtime`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub namespace: String,
    pub room: Option<String>,
    pub event: String,
    pub payload: Value,
}

/// Realtime channel that records namespaces and emitted events.
#[derive(Default)]
pub struct MemoryRealtime {
    namespaces: RwLock<HashSet<String>>,
    emitted: Mutex<Vec<EmittedEvent>>,
}

impl MemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn emitted(&self) -> Vec<EmittedEvent> {
        self.emitted.lock().await.clone()
    }
}

#[async_trait]
impl Realtime for MemoryRealtime {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StackError> {
        Ok(self.namespaces.read().await.contains(namespace))
    }

    async fn ensure_namespace(&self, _tenant_id: &str, namespace: &str) -> Result<(), StackError> {
        self.namespaces.write().await.insert(namespace.to_string());
        Ok(())
    }

    async fn emit(
        &self,
        namespace: &str,
        room: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<(), StackError> {
        self.emitted.lock().await.push(EmittedEvent {
            namespace: namespace.to_string(),
            room: room.map(str::to_string),
            event: event.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
