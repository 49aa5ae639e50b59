//! Credential issuance.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};

/// `util_create_token`: issues a credential for the calling tenant.
///
/// Params: `payload` (any JSON), `expiry_ms`, `allowed_uses`.
pub struct CreateTokenTask;

#[async_trait]
impl TaskFunction for CreateTokenTask {
    fn name(&self) -> &'static str {
        "util_create_token"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let payload = task.param("payload").cloned().unwrap_or(Value::Null);
        let expiry = match task.param("expiry_ms") {
            None => None,
            Some(v) => Some(Duration::from_millis(v.as_u64().ok_or(TaskError::InvalidDefinition)?)),
        };
        let allowed_uses = match task.param("allowed_uses") {
            None => None,
            Some(v) => Some(
                v.as_i64()
                    .filter(|n| *n > 0)
                    .ok_or(TaskError::InvalidDefinition)?,
            ),
        };

        let token = scope
            .stack
            .tokens
            .issue(scope.tenant_id, payload, expiry, allowed_uses)
            .await?;

        results.insert("token".to_string(), json!(token));
        metrics.mark_success();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;
    use crate::tasks::test_support::{run, TENANT};

    #[tokio::test]
    async fn test_token_carries_tenant_and_payload() {
        let stack = Stack::in_memory();
        let out = run(&CreateTokenTask, &stack, json!({ "payload": { "scope": "read" } })).await;
        out.result.unwrap();

        let token = out.results["token"].as_str().unwrap();
        let claims = stack.tokens.verify(token).await.unwrap();
        assert_eq!(claims.sub, TENANT);
        assert_eq!(claims.payload, json!({ "scope": "read" }));
    }

    #[tokio::test]
    async fn test_limited_token_is_consumed() {
        let stack = Stack::in_memory();
        let out = run(&CreateTokenTask, &stack, json!({ "allowed_uses": 1 })).await;
        let token = out.results["token"].as_str().unwrap();

        stack.tokens.verify(token).await.unwrap();
        assert!(stack.tokens.verify(token).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_allowed_uses() {
        let stack = Stack::in_memory();
        let out = run(&CreateTokenTask, &stack, json!({ "allowed_uses": 0 })).await;
        assert!(matches!(out.result, Err(TaskError::InvalidDefinition)));
    }
}
