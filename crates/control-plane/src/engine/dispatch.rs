//! Dispatch adapter: turns deferred tasks into broker publishes.

use std::sync::Arc;

use execustack_tasks::definition::DeferredExecution;
use execustack_tasks::stack::{execution_exchange, execution_queue, Broker};
use execustack_tasks::{Destination, ExchangeKind, ExecutionContext, StackError, TaskResults};
use tracing::{debug, info};

use crate::result_ext::ResultExt;

/// Fanout exchange receiving the results of one function for a tenant.
pub fn results_exchange(tenant_id: &str, function: &str) -> Destination {
    Destination::Exchange {
        name: format!("results.{}.{}", tenant_id, function),
        kind: ExchangeKind::Fanout,
        routing_key: None,
    }
}

/// Publishes deferred tasks and, optionally, per-task results.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish every deferred task of a finished run.
    ///
    /// Broadcast tasks go to the tenant's fanout exchange, the rest to its
    /// queue. Failures are logged and do not affect the run. Returns the
    /// number of tasks published.
    pub async fn dispatch(&self, ctx: &ExecutionContext) -> usize {
        let mut published = 0;
        for task in &ctx.deferred_tasks {
            let destination = if task.is_broadcast {
                execution_exchange(&ctx.tenant_id)
            } else {
                execution_queue(&ctx.tenant_id)
            };
            let message = DeferredExecution::single(&ctx.run_id, task.clone());

            let sent = self
                .publish_json(&destination, &message)
                .await
                .log(format!("dispatching deferred task {}", task.name));
            if sent.is_ok() {
                debug!(run_id = %ctx.run_id, task = %task.name, ?destination, "Deferred task dispatched");
                published += 1;
            }
        }

        if published > 0 {
            info!(run_id = %ctx.run_id, published, "Dispatched deferred tasks");
        }
        published
    }

    /// Publish one task's results to its function's results exchange.
    pub async fn publish_results(&self, tenant_id: &str, function: &str, results: &TaskResults) {
        let _ = self
            .publish_json(&results_exchange(tenant_id, function), results)
            .await
            .log(format!("publishing results of {}", function));
    }

    async fn publish_json<T: serde::Serialize>(
        &self,
        destination: &Destination,
        message: &T,
    ) -> Result<(), StackError> {
        let body = serde_json::to_vec(message).map_err(|e| StackError::Broker(e.to_string()))?;
        self.broker.publish(destination, &body).await
    }
}
