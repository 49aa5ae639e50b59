//! Worker lifecycle management.

use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::WorkerConfig;
use crate::nats::subscriber::{ack, delivery_count, nack, term};
use crate::nats::{tenant_from_subject, NatsSubscriber};
use crate::runner::{disposition, DeferredRunner, Disposition};

/// Worker that runs deferred executions from NATS.
pub struct Worker {
    config: WorkerConfig,

    subscriber: NatsSubscriber,

    runner: DeferredRunner,

    /// Bounds concurrent runs across queue and fanout deliveries.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Create a new worker.
    pub async fn new(config: WorkerConfig, client: async_nats::Client, runner: DeferredRunner) -> Result<Self> {
        let subscriber =
            NatsSubscriber::connect(client, &config.nats_stream, &config.nats_consumer).await?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs));

        Ok(Self {
            config,
            subscriber,
            runner,
            semaphore,
        })
    }

    /// Run the worker until the queue consumer fails.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            worker_id = %self.config.worker_id,
            max_concurrent_runs = self.config.max_concurrent_runs,
            "Worker started"
        );

        let status_handle = self.start_status_log();
        let fanout_handle = if self.config.consume_fanout {
            Some(self.start_fanout().await?)
        } else {
            None
        };

        let result = self.process_queue().await;

        status_handle.abort();
        if let Some(handle) = fanout_handle {
            handle.abort();
        }

        result
    }

    /// Periodically log pool utilisation.
    fn start_status_log(&self) -> tokio::task::JoinHandle<()> {
        let semaphore = self.semaphore.clone();
        let worker_id = self.config.worker_id.clone();
        let capacity = self.config.max_concurrent_runs;
        let interval = self.config.status_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;
                let in_flight = capacity - semaphore.available_permits();
                tracing::debug!(worker_id = %worker_id, in_flight, capacity, "Worker status");
            }
        })
    }

    /// Run broadcast executions. Core NATS has no redelivery, so failures
    /// are only logged.
    async fn start_fanout(&self) -> Result<tokio::task::JoinHandle<()>> {
        let mut subscription = self.subscriber.subscribe_fanout().await?;
        let runner = self.runner.clone();
        let semaphore = self.semaphore.clone();

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let Some(tenant_id) = tenant_from_subject(message.subject.as_str()).map(str::to_string)
                else {
                    tracing::warn!(subject = %message.subject, "Ignoring message on unexpected subject");
                    continue;
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let runner = runner.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = runner.run(&tenant_id, &message.payload).await {
                        tracing::error!(tenant_id = %tenant_id, error = %e, "Broadcast execution failed");
                    }
                });
            }
            tracing::info!("Broadcast subscription closed");
        }))
    }

    /// Process queued executions from JetStream.
    async fn process_queue(&self) -> Result<()> {
        loop {
            // Wait for available slot
            let permit = self.semaphore.clone().acquire_owned().await?;

            let Some(msg) = self.subscriber.receive().await? else {
                // No message, release permit and continue
                drop(permit);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            };

            let Some(tenant_id) = tenant_from_subject(msg.subject.as_str()).map(str::to_string) else {
                tracing::warn!(subject = %msg.subject, "Terminating message on unexpected subject");
                term(&msg).await?;
                continue;
            };

            let runner = self.runner.clone();
            let max_deliveries = self.config.max_deliveries;

            tokio::spawn(async move {
                // Keep permit until done
                let _permit = permit;

                let delivered = delivery_count(&msg);
                tracing::debug!(tenant_id = %tenant_id, delivered, "Received queued execution");

                let result = runner.run(&tenant_id, &msg.payload).await;
                let settled = match disposition(&result, delivered, max_deliveries) {
                    Disposition::Ack => ack(&msg).await,
                    Disposition::Nak => {
                        if let Err(e) = &result {
                            tracing::warn!(tenant_id = %tenant_id, delivered, error = %e, "Queued execution failed, will retry");
                        }
                        nack(&msg).await
                    }
                    Disposition::DeadLetter => {
                        if let Err(e) = &result {
                            runner.dead_letter(&tenant_id, &msg.payload, e).await;
                        }
                        term(&msg).await
                    }
                };
                if let Err(e) = settled {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Failed to settle message");
                }
            });
        }
    }
}
