//! Optimistic document versioning.
//!
//! A document id owns a live document (maybe deleted) plus immutable version
//! records in [`VERSIONS_COLLECTION`]. The live document is "latest" when its
//! version is strictly greater than the highest recorded version; otherwise a
//! record already covers the current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::TaskError;
use crate::stack::DocumentStore;
use crate::util::{collection_from_id, generate_document_id};

/// Collection holding version records.
pub const VERSIONS_COLLECTION: &str = "es-versions";

pub const FIELD_ID: &str = "id";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_DERIVED_FROM: &str = "derived_from_version";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";

/// Immutable snapshot of one historical document version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    pub document_id: String,
    pub version: u64,
    pub derived_from_version: u64,
    pub run_id: String,
    pub document: Value,
    pub created_at: DateTime<Utc>,
}

/// Current timestamp as stored on documents.
pub fn timestamp() -> Value {
    json!(Utc::now())
}

/// Version of a document (0 when unversioned).
pub fn version_of(document: &Value) -> u64 {
    document.get(FIELD_VERSION).and_then(Value::as_u64).unwrap_or(0)
}

/// Stamp version, lineage and `updated_at` onto a document.
pub fn stamp(document: &mut Map<String, Value>, version: u64, derived_from_version: u64) {
    document.insert(FIELD_UPDATED_AT.to_string(), timestamp());
    document.insert(FIELD_VERSION.to_string(), json!(version));
    document.insert(FIELD_DERIVED_FROM.to_string(), json!(derived_from_version));
}

/// Live document and latest version record of a document id.
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub collection: String,
    pub id: String,
    pub document: Option<Value>,
    pub latest_record: Option<VersionRecord>,
}

impl DocumentState {
    /// Load the state of `id`; the collection is derived from the id.
    pub async fn load(
        store: &dyn DocumentStore,
        tenant_id: &str,
        id: &str,
    ) -> Result<Self, TaskError> {
        let collection = collection_from_id(id).ok_or(TaskError::InvalidDefinition)?;
        let document = store
            .find_one(tenant_id, collection, &json!({ FIELD_ID: id }))
            .await?;
        let latest_record = latest_record(store, tenant_id, id).await?;

        Ok(Self {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
            latest_record,
        })
    }

    pub fn recorded_version(&self) -> u64 {
        self.latest_record.as_ref().map(|r| r.version).unwrap_or(0)
    }

    pub fn live_version(&self) -> u64 {
        self.document.as_ref().map(version_of).unwrap_or(0)
    }

    /// Whether the live document is newer than every record.
    pub fn is_document_latest(&self) -> bool {
        self.document.is_some() && self.live_version() > self.recorded_version()
    }

    /// Version number the next mutation assigns.
    pub fn next_version(&self) -> u64 {
        self.live_version().max(self.recorded_version()) + 1
    }

    /// The live document, or `DocumentNotFound`.
    pub fn require_document(&self) -> Result<&Value, TaskError> {
        self.document.as_ref().ok_or(TaskError::DocumentNotFound)
    }
}

fn parse_record(value: Value) -> Result<VersionRecord, TaskError> {
    Ok(serde_json::from_value(value)?)
}

/// Highest-numbered version record of a document.
pub async fn latest_record(
    store: &dyn DocumentStore,
    tenant_id: &str,
    document_id: &str,
) -> Result<Option<VersionRecord>, TaskError> {
    let pipeline = [
        json!({ "$match": { "document_id": document_id } }),
        json!({ "$sort": { FIELD_VERSION: -1 } }),
        json!({ "$limit": 1 }),
    ];
    let mut rows = store.query(tenant_id, VERSIONS_COLLECTION, &pipeline).await?;
    rows.pop().map(parse_record).transpose()
}

/// Version record of a specific version.
pub async fn find_record(
    store: &dyn DocumentStore,
    tenant_id: &str,
    document_id: &str,
    version: u64,
) -> Result<Option<VersionRecord>, TaskError> {
    store
        .find_one(
            tenant_id,
            VERSIONS_COLLECTION,
            &json!({ "document_id": document_id, FIELD_VERSION: version }),
        )
        .await?
        .map(parse_record)
        .transpose()
}

/// Snapshot `document` into a version record, idempotent on
/// `(document_id, version)`.
pub async fn save_version_record(
    store: &dyn DocumentStore,
    tenant_id: &str,
    run_id: &str,
    document: &Value,
) -> Result<VersionRecord, TaskError> {
    let document_id = document
        .get(FIELD_ID)
        .and_then(Value::as_str)
        .ok_or(TaskError::DocumentNotFound)?
        .to_string();
    let version = version_of(document);
    let filter = json!({ "document_id": document_id, FIELD_VERSION: version });

    let id = match store.find_one(tenant_id, VERSIONS_COLLECTION, &filter).await? {
        Some(existing) => existing
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .map(str::to_string),
        None => None,
    };
    let id = match id {
        Some(id) => id,
        None => generate_document_id(store, tenant_id, VERSIONS_COLLECTION).await?,
    };

    let record = VersionRecord {
        id,
        document_id,
        version,
        derived_from_version: document
            .get(FIELD_DERIVED_FROM)
            .and_then(Value::as_u64)
            .unwrap_or(0),
        run_id: run_id.to_string(),
        document: document.clone(),
        created_at: Utc::now(),
    };
    store
        .replace(tenant_id, VERSIONS_COLLECTION, &filter, serde_json::to_value(&record)?)
        .await?;

    tracing::debug!(document_id = %record.document_id, version, "Saved version record");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    async fn seed(stack: &Stack, version: u64) -> Value {
        let doc = json!({ "id": "users~1", "name": "a", "version": version, "derived_from_version": version.saturating_sub(1) });
        stack
            .store
            .replace("acme", "users", &json!({ "id": "users~1" }), doc.clone())
            .await
            .unwrap();
        doc
    }

    #[tokio::test]
    async fn test_fresh_document_is_latest() {
        let stack = Stack::in_memory();
        seed(&stack, 1).await;

        let state = DocumentState::load(stack.store.as_ref(), "acme", "users~1").await.unwrap();
        assert!(state.is_document_latest());
        assert_eq!(state.next_version(), 2);
        assert_eq!(state.collection, "users");
    }

    #[tokio::test]
    async fn test_recorded_state_is_not_latest() {
        let stack = Stack::in_memory();
        let doc = seed(&stack, 2).await;
        save_version_record(stack.store.as_ref(), "acme", "run", &doc).await.unwrap();

        let state = DocumentState::load(stack.store.as_ref(), "acme", "users~1").await.unwrap();
        assert!(!state.is_document_latest());
        assert_eq!(state.recorded_version(), 2);
        assert_eq!(state.next_version(), 3);
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_version() {
        let stack = Stack::in_memory();
        let doc = seed(&stack, 1).await;
        let first = save_version_record(stack.store.as_ref(), "acme", "run-1", &doc).await.unwrap();
        let second = save_version_record(stack.store.as_ref(), "acme", "run-2", &doc).await.unwrap();

        assert_eq!(first.id, second.id);
        let rows = stack
            .store
            .query("acme", VERSIONS_COLLECTION, &[json!({ "$match": { "document_id": "users~1" } })])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["run_id"], json!("run-2"));
    }

    #[tokio::test]
    async fn test_find_record_and_latest() {
        let stack = Stack::in_memory();
        for v in 1..=3 {
            let doc = json!({ "id": "users~1", "version": v });
            save_version_record(stack.store.as_ref(), "acme", "run", &doc).await.unwrap();
        }

        let latest = latest_record(stack.store.as_ref(), "acme", "users~1").await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert!(find_record(stack.store.as_ref(), "acme", "users~1", 2).await.unwrap().is_some());
        assert!(find_record(stack.store.as_ref(), "acme", "users~1", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_id_is_definition_error() {
        let stack = Stack::in_memory();
        let err = DocumentState::load(stack.store.as_ref(), "acme", "no-collection").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidDefinition));
    }

    #[test]
    fn test_stamp() {
        let mut doc = Map::new();
        stamp(&mut doc, 4, 3);
        assert_eq!(doc[FIELD_VERSION], json!(4));
        assert_eq!(doc[FIELD_DERIVED_FROM], json!(3));
        assert!(doc.contains_key(FIELD_UPDATED_AT));
    }
}
