//! NATS consumers for deferred executions.
//!
//! Queued executions arrive on the JetStream work-queue through a durable
//! pull consumer shared by the whole pool, so each one runs once. Broadcast
//! executions arrive on core NATS fanout subjects and reach every worker.

use anyhow::Result;
use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, AckKind, Context};
use futures::StreamExt;

use execustack_control_plane::nats::broker::{ensure_stream, FANOUT_PREFIX, QUEUE_PREFIX};

/// Name shared by the per-tenant execution queue and fanout exchange.
const EXECUTIONS: &str = "executions";

/// Subjects of every tenant's execution queue.
pub const EXECUTION_QUEUE_SUBJECTS: &str = "es.queue.executions.>";

/// Subjects of every tenant's execution fanout exchange.
pub const EXECUTION_FANOUT_SUBJECTS: &str = "es.fanout.executions.*";

/// Tenant id of an execution queue or fanout subject.
pub fn tenant_from_subject(subject: &str) -> Option<&str> {
    [QUEUE_PREFIX, FANOUT_PREFIX]
        .iter()
        .find_map(|prefix| {
            subject
                .strip_prefix(prefix)?
                .strip_prefix('.')?
                .strip_prefix(EXECUTIONS)?
                .strip_prefix('.')
        })
        .filter(|tenant| !tenant.is_empty())
}

/// JetStream consumer of the execution queues plus the fanout subscription.
pub struct NatsSubscriber {
    client: async_nats::Client,

    consumer: jetstream::consumer::Consumer<ConsumerConfig>,
}

impl NatsSubscriber {
    /// Make sure the stream and the durable consumer exist.
    pub async fn connect(client: async_nats::Client, stream: &str, consumer: &str) -> Result<Self> {
        let js = jetstream::new(client.clone());
        ensure_stream(&js).await?;
        let consumer = ensure_consumer(&js, stream, consumer).await?;
        Ok(Self { client, consumer })
    }

    /// Fetch the next queued execution, if one is waiting.
    pub async fn receive(&self) -> Result<Option<jetstream::Message>> {
        let mut messages = self.consumer.fetch().max_messages(1).messages().await?;

        if let Some(msg) = messages.next().await {
            let msg = msg.map_err(|e| anyhow::anyhow!("Failed to receive message: {}", e))?;
            return Ok(Some(msg));
        }

        Ok(None)
    }

    /// Subscribe to broadcast executions.
    pub async fn subscribe_fanout(&self) -> Result<async_nats::Subscriber> {
        let subscriber = self.client.subscribe(EXECUTION_FANOUT_SUBJECTS).await?;
        tracing::info!(subject = %EXECUTION_FANOUT_SUBJECTS, "Subscribed to broadcast executions");
        Ok(subscriber)
    }
}

async fn ensure_consumer(
    js: &Context,
    stream: &str,
    name: &str,
) -> Result<jetstream::consumer::Consumer<ConsumerConfig>> {
    let stream = js.get_stream(stream).await?;

    match stream.get_consumer(name).await {
        Ok(consumer) => Ok(consumer),
        Err(_) => {
            let config = ConsumerConfig {
                durable_name: Some(name.to_string()),
                filter_subject: EXECUTION_QUEUE_SUBJECTS.to_string(),
                ..Default::default()
            };
            let consumer = stream.create_consumer(config).await?;
            tracing::info!(consumer = %name, "Created NATS consumer");
            Ok(consumer)
        }
    }
}

/// Times the message has been delivered, counting this delivery.
pub fn delivery_count(msg: &jetstream::Message) -> i64 {
    msg.info().map(|info| info.delivered).unwrap_or(1)
}

/// Acknowledge a message.
pub async fn ack(msg: &jetstream::Message) -> Result<()> {
    msg.ack()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to ack message: {}", e))
}

/// Negatively acknowledge a message (will be redelivered).
pub async fn nack(msg: &jetstream::Message) -> Result<()> {
    msg.ack_with(AckKind::Nak(None))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to nack message: {}", e))
}

/// Stop redelivery of a message.
pub async fn term(msg: &jetstream::Message) -> Result<()> {
    msg.ack_with(AckKind::Term)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to terminate message: {}", e))
}
