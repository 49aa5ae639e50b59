//! NATS integration.
//!
//! - [`broker`]: broker adapter mapping queues and exchanges onto subjects
//! - [`relay`]: realtime relay from worker processes to control-plane hubs

pub mod broker;
pub mod relay;

pub use broker::{subject_for, NatsBroker, QUEUE_STREAM};
pub use relay::{spawn_relay, NatsRealtime, RelayMessage};

/// Connect to NATS.
pub async fn connect(url: &str) -> Result<async_nats::Client, async_nats::ConnectError> {
    let client = async_nats::connect(url).await?;
    tracing::info!(url = %url, "Connected to NATS");
    Ok(client)
}
