//! NATS broker adapter.
//!
//! Queues are JetStream work-queue subjects so each message reaches exactly
//! one consumer; exchanges are core NATS subjects delivered to every
//! subscriber.

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;

use execustack_tasks::stack::Broker;
use execustack_tasks::{Destination, ExchangeKind, StackError};

/// JetStream stream backing every queue.
pub const QUEUE_STREAM: &str = "ES_QUEUES";

/// Subject prefix of queue messages.
pub const QUEUE_PREFIX: &str = "es.queue";

/// Subject prefix of fanout exchanges.
pub const FANOUT_PREFIX: &str = "es.fanout";

/// Subject prefix of direct exchanges.
pub const DIRECT_PREFIX: &str = "es.direct";

/// NATS subject a destination publishes to.
pub fn subject_for(destination: &Destination) -> String {
    match destination {
        Destination::Queue(name) => format!("{}.{}", QUEUE_PREFIX, name),
        Destination::Exchange {
            name,
            kind: ExchangeKind::Fanout,
            ..
        } => format!("{}.{}", FANOUT_PREFIX, name),
        Destination::Exchange {
            name,
            kind: ExchangeKind::Direct,
            routing_key: Some(routing_key),
        } => format!("{}.{}.{}", DIRECT_PREFIX, name, routing_key),
        Destination::Exchange {
            name,
            kind: ExchangeKind::Direct,
            routing_key: None,
        } => format!("{}.{}", DIRECT_PREFIX, name),
    }
}

/// Broker over a NATS connection.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    js: Context,
}

impl NatsBroker {
    /// Create the broker, making sure the queue stream exists.
    pub async fn new(client: async_nats::Client) -> Result<Self, StackError> {
        let js = jetstream::new(client.clone());
        ensure_stream(&js).await?;
        Ok(Self { client, js })
    }
}

/// Ensure the work-queue stream exists.
pub async fn ensure_stream(js: &Context) -> Result<(), StackError> {
    match js.get_stream(QUEUE_STREAM).await {
        Ok(_) => {
            tracing::debug!(stream = %QUEUE_STREAM, "Using existing NATS stream");
            Ok(())
        }
        Err(_) => {
            let config = jetstream::stream::Config {
                name: QUEUE_STREAM.to_string(),
                subjects: vec![format!("{}.>", QUEUE_PREFIX)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            };
            js.create_stream(config)
                .await
                .map_err(|e| StackError::Broker(e.to_string()))?;

            tracing::info!(stream = %QUEUE_STREAM, "Created NATS stream");
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, destination: &Destination, payload: &[u8]) -> Result<(), StackError> {
        let subject = subject_for(destination);
        match destination {
            Destination::Queue(_) => {
                self.js
                    .publish(subject.clone(), payload.to_vec().into())
                    .await
                    .map_err(|e| StackError::Broker(e.to_string()))?
                    .await
                    .map_err(|e| StackError::Broker(e.to_string()))?;
            }
            Destination::Exchange { .. } => {
                self.client
                    .publish(subject.clone(), payload.to_vec().into())
                    .await
                    .map_err(|e| StackError::Broker(e.to_string()))?;
            }
        }

        tracing::debug!(subject = %subject, bytes = payload.len(), "Published message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execustack_tasks::stack::{execution_dead_letter_queue, execution_exchange, execution_queue};

    #[test]
    fn test_execution_subjects() {
        assert_eq!(subject_for(&execution_queue("acme")), "es.queue.executions.acme");
        assert_eq!(subject_for(&execution_exchange("acme")), "es.fanout.executions.acme");
        assert_eq!(
            subject_for(&execution_dead_letter_queue("acme")),
            "es.queue.executions-errors.acme"
        );
    }

    #[test]
    fn test_direct_exchange_subjects() {
        let routed = Destination::Exchange {
            name: "acme-orders".to_string(),
            kind: ExchangeKind::Direct,
            routing_key: Some("acme-created".to_string()),
        };
        assert_eq!(subject_for(&routed), "es.direct.acme-orders.acme-created");

        let unrouted = Destination::Exchange {
            name: "acme-orders".to_string(),
            kind: ExchangeKind::Direct,
            routing_key: None,
        };
        assert_eq!(subject_for(&unrouted), "es.direct.acme-orders");
    }
}
