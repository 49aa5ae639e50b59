//! Runs deferred executions through the orchestrator and decides what
//! happens to the message that carried them.

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use execustack_control_plane::engine::Orchestrator;
use execustack_control_plane::ResultExt;
use execustack_tasks::stack::execution_dead_letter_queue;
use execustack_tasks::{DeferredExecution, ExecutionContext};

/// Why a deferred execution did not succeed.
#[derive(Debug, Error)]
pub enum RunError {
    /// The payload is not a deferred execution; retrying cannot help.
    #[error("invalid deferred execution: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("run {run_id} failed: {message}")]
    Failed { run_id: String, message: String },
}

/// What to do with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Redeliver later.
    Nak,
    /// Publish to the dead-letter queue and stop redelivery.
    DeadLetter,
}

/// Disposition of a message after its `delivered`-th delivery.
pub fn disposition(result: &Result<ExecutionContext, RunError>, delivered: i64, max_deliveries: i64) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(RunError::Decode(_)) => Disposition::DeadLetter,
        Err(RunError::Failed { .. }) if delivered >= max_deliveries => Disposition::DeadLetter,
        Err(RunError::Failed { .. }) => Disposition::Nak,
    }
}

/// Executes deferred payloads for a tenant.
#[derive(Clone)]
pub struct DeferredRunner {
    orchestrator: Arc<Orchestrator>,
}

impl DeferredRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Decode and run one deferred execution.
    pub async fn run(&self, tenant_id: &str, payload: &[u8]) -> Result<ExecutionContext, RunError> {
        let deferred: DeferredExecution = serde_json::from_slice(payload)?;
        let definition = deferred.into_definition();

        let ctx = self.orchestrator.execute(tenant_id, definition).await;
        if ctx.execution_metrics.is_success {
            tracing::info!(
                tenant_id = %tenant_id,
                run_id = %ctx.run_id,
                queued_from_run_id = ?ctx.queued_from_run_id,
                "Deferred execution succeeded"
            );
            Ok(ctx)
        } else {
            Err(RunError::Failed {
                run_id: ctx.run_id.clone(),
                message: ctx
                    .execution_metrics
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string()),
            })
        }
    }

    /// Publish the original payload and the error to the tenant's
    /// dead-letter queue.
    pub async fn dead_letter(&self, tenant_id: &str, payload: &[u8], error: &RunError) {
        let original = serde_json::from_slice::<Value>(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        let body = json!({ "payload": original, "error": error.to_string() });

        let destination = execution_dead_letter_queue(tenant_id);
        let published = match serde_json::to_vec(&body) {
            Ok(bytes) => self
                .orchestrator
                .stack()
                .broker
                .publish(&destination, &bytes)
                .await
                .log(format!("dead-lettering execution for tenant {}", tenant_id))
                .is_ok(),
            Err(_) => false,
        };
        if published {
            tracing::warn!(tenant_id = %tenant_id, error = %error, "Execution dead-lettered");
        }
    }
}
