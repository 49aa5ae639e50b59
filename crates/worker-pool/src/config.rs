//! Worker configuration.

use serde::Deserialize;
use std::time::Duration;

use execustack_control_plane::nats::QUEUE_STREAM;

/// Worker pool configuration.
///
/// Environment variables are prefixed with `EXECUSTACK_WORKER_`:
/// - `EXECUSTACK_WORKER_WORKER_ID`: Worker identifier (default: `<hostname>-<uuid>`)
/// - `EXECUSTACK_WORKER_NATS_URL`: NATS server URL
/// - `EXECUSTACK_WORKER_NATS_STREAM`: JetStream stream holding the queues
/// - `EXECUSTACK_WORKER_NATS_CONSUMER`: Durable consumer name, shared by the pool
/// - `EXECUSTACK_WORKER_MAX_CONCURRENT_RUNS`
/// - `EXECUSTACK_WORKER_MAX_DELIVERIES`: Deliveries before a message is dead-lettered
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    #[serde(default = "default_nats_consumer")]
    pub nats_consumer: String,

    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: i64,

    /// Also run broadcast tasks from the per-tenant fanout exchanges
    #[serde(default = "default_consume_fanout")]
    pub consume_fanout: bool,

    /// Interval of the pool status log line, in seconds
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    QUEUE_STREAM.to_string()
}

fn default_nats_consumer() -> String {
    "execustack-worker".to_string()
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_max_deliveries() -> i64 {
    5
}

fn default_consume_fanout() -> bool {
    true
}

fn default_status_interval_secs() -> u64 {
    30
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("EXECUSTACK_WORKER_").from_env::<WorkerConfig>()
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            nats_url: default_nats_url(),
            nats_stream: default_nats_stream(),
            nats_consumer: default_nats_consumer(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_deliveries: default_max_deliveries(),
            consume_fanout: default_consume_fanout(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.nats_stream, "ES_QUEUES");
        assert_eq!(config.nats_consumer, "execustack-worker");
        assert_eq!(config.max_concurrent_runs, 4);
        assert_eq!(config.max_deliveries, 5);
        assert!(config.consume_fanout);
    }

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(WorkerConfig::default().worker_id, WorkerConfig::default().worker_id);
    }
}
