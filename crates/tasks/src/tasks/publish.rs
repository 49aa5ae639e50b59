//! Message broker publishing.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};
use crate::stack::{Destination, ExchangeKind};

#[derive(Debug, Default, Deserialize)]
struct PublishOptions {
    #[serde(default)]
    routing_key: Option<String>,
    #[serde(default)]
    exchange_options: Option<ExchangeOptions>,
}

#[derive(Debug, Deserialize)]
struct ExchangeOptions {
    exchange_name: String,
    #[serde(default)]
    exchange_type: ExchangeKind,
}

/// Tenant-prefixed destination for a publish request.
fn destination(tenant_id: &str, options: PublishOptions) -> Result<Destination, TaskError> {
    let prefixed = |name: &str| format!("{}-{}", tenant_id, name);
    let routing_key = options.routing_key.filter(|k| !k.is_empty());

    match (options.exchange_options, routing_key) {
        (Some(exchange), routing_key) if !exchange.exchange_name.is_empty() => Ok(Destination::Exchange {
            name: prefixed(&exchange.exchange_name),
            kind: exchange.exchange_type,
            routing_key: routing_key.as_deref().map(prefixed),
        }),
        (None, Some(queue)) => Ok(Destination::Queue(prefixed(&queue))),
        _ => Err(TaskError::InvalidDefinition),
    }
}

/// `bus_publish`: publishes `payload` to a tenant-scoped queue or exchange.
///
/// String payloads are sent as raw bytes, anything else as JSON.
pub struct BusPublishTask;

#[async_trait]
impl TaskFunction for BusPublishTask {
    fn name(&self) -> &'static str {
        "bus_publish"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let options: PublishOptions = match task.param("publish_options") {
            Some(v) => serde_json::from_value(v.clone()).map_err(|_| TaskError::InvalidDefinition)?,
            None => PublishOptions::default(),
        };
        let destination = destination(scope.tenant_id, options)?;

        let body = match task.param("payload") {
            Some(Value::String(s)) => s.clone().into_bytes(),
            Some(v) => serde_json::to_vec(v)?,
            None => Vec::new(),
        };
        scope.stack.broker.publish(&destination, &body).await?;

        results.insert("is_published".to_string(), json!(true));
        metrics.mark_success();
        Ok(())
    }
}
