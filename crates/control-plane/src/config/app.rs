//! Application configuration for the ExecuStack Control Plane server.

use serde::Deserialize;
use std::time::Duration;

use execustack_tasks::lock::LockSettings;
use execustack_tasks::StackSettings;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `EXECUSTACK_`:
/// - `EXECUSTACK_HOST`: Server bind address (default: "0.0.0.0")
/// - `EXECUSTACK_PORT`: Server port (default: 8080)
/// - `EXECUSTACK_PUBLIC_URL`: Base URL handed to realtime clients
/// - `EXECUSTACK_ADMIN_CLIENT_ID` / `EXECUSTACK_ADMIN_API_KEY`: bootstrap client
/// - `EXECUSTACK_TOKEN_SECRET`: Credential signing secret
/// - `EXECUSTACK_NATS_URL`: NATS server (optional)
/// - `EXECUSTACK_IN_MEMORY`: Run without PostgreSQL
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Base URL realtime clients connect to
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Tenant id of the admin client that owns the client registry
    #[serde(default = "default_admin_client_id")]
    pub admin_client_id: String,

    /// API key of the admin client
    #[serde(default = "default_admin_api_key")]
    pub admin_api_key: String,

    /// Credential signing secret
    #[serde(default)]
    pub token_secret: Option<String>,

    /// Default credential lifetime in milliseconds
    #[serde(default = "default_token_expiry_ms")]
    pub token_default_expiry_ms: u64,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: u32,

    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,

    #[serde(default = "default_lock_retry_jitter_ms")]
    pub lock_retry_jitter_ms: u64,

    /// Use in-memory collaborators instead of PostgreSQL
    #[serde(default)]
    pub in_memory: bool,

    /// Publish every executed task's results to `results.<tenant>.<function>`
    #[serde(default)]
    pub publish_results: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "execustack-control-plane".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_admin_client_id() -> String {
    "admin".to_string()
}

fn default_admin_api_key() -> String {
    "es_default_key".to_string()
}

fn default_token_expiry_ms() -> u64 {
    90 * 24 * 60 * 60 * 1000
}

fn default_lock_ttl_ms() -> u64 {
    10_000
}

fn default_lock_retry_count() -> u32 {
    10
}

fn default_lock_retry_delay_ms() -> u64 {
    200
}

fn default_lock_retry_jitter_ms() -> u64 {
    200
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `EXECUSTACK_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("EXECUSTACK_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            retry_count: self.lock_retry_count,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
            retry_jitter: Duration::from_millis(self.lock_retry_jitter_ms),
        }
    }

    /// Settings handed to task functions.
    pub fn stack_settings(&self) -> StackSettings {
        StackSettings {
            public_url: self.public_url.clone(),
            lock: self.lock_settings(),
        }
    }

    pub fn token_default_expiry(&self) -> Duration {
        Duration::from_millis(self.token_default_expiry_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            public_url: default_public_url(),
            admin_client_id: default_admin_client_id(),
            admin_api_key: default_admin_api_key(),
            token_secret: None,
            token_default_expiry_ms: default_token_expiry_ms(),
            nats_url: None,
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_retry_count: default_lock_retry_count(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            lock_retry_jitter_ms: default_lock_retry_jitter_ms(),
            in_memory: false,
            publish_results: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.admin_client_id, "admin");
        assert!(!config.in_memory);
        assert!(!config.publish_results);
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_lock_settings_match_library_defaults() {
        assert_eq!(AppConfig::default().lock_settings(), LockSettings::default());
    }
}
