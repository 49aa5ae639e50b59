//! Small helpers shared by task functions and the orchestrator.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Instant;

use crate::error::TaskError;
use crate::stack::DocumentStore;

/// Separator between collection name and uuid in document ids.
pub const ID_SEPARATOR: char = '~';

/// Default length of generated random strings.
pub const DEFAULT_RANDOM_LENGTH: usize = 20;

/// Hex-encoded SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Random lowercase hex string of `length` characters.
pub fn random_string(length: usize) -> String {
    let mut bytes = vec![0u8; length.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut s = hex::encode(bytes);
    s.truncate(length);
    s
}

/// Collection a document id belongs to (everything before the last `~`).
pub fn collection_from_id(id: &str) -> Option<&str> {
    id.rsplit_once(ID_SEPARATOR)
        .map(|(collection, _)| collection)
        .filter(|c| !c.is_empty())
}

/// Generate a collision-checked `<collection>~<uuid>` id.
pub async fn generate_document_id(
    store: &dyn DocumentStore,
    tenant_id: &str,
    collection: &str,
) -> Result<String, TaskError> {
    loop {
        let id = format!("{}{}{}", collection, ID_SEPARATOR, uuid::Uuid::new_v4());
        let filter = serde_json::json!({ "id": id });
        if store.find_one(tenant_id, collection, &filter).await?.is_none() {
            return Ok(id);
        }
        tracing::debug!(%id, "Generated id already taken, retrying");
    }
}

/// Normalise a namespace or room name: trim, lowercase, whitespace runs to `_`.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Elapsed-time tracker for runs and tasks.
#[derive(Debug)]
pub struct PrecisionTimer {
    name: String,
    start: Instant,
}

impl PrecisionTimer {
    pub fn start(name: impl Into<String>) -> Self {
        let name = name.into();
        tracing::trace!(timer = %name, "start timer");
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Milliseconds since start, logged under `label`.
    pub fn tick(&self, label: &str) -> f64 {
        let ms = self.start.elapsed().as_secs_f64() * 1000.0;
        tracing::trace!(timer = %self.name, label, ms, "timer tick");
        ms
    }

    pub fn stop(&self) -> f64 {
        self.tick("stop")
    }
}
