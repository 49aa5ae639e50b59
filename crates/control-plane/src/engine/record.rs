//! Persisted run records.

use serde_json::{json, Value};

use execustack_tasks::versioning::timestamp;
use execustack_tasks::{ExecutionContext, StackError, Stack};

/// Collection holding one record per run, keyed by run id.
pub const RUNS_COLLECTION: &str = "es-executions";

/// Durable view of a finished run.
///
/// Parameters and results are not kept; definitions are already reduced to
/// `{name, function}` by the time a run is persisted.
pub fn run_record(ctx: &ExecutionContext) -> Value {
    let now = timestamp();
    let mut record = json!({
        "id": ctx.run_id,
        "execution_definition": ctx.execution_definition,
        "evaluated_tasks_definitions": ctx.evaluated_tasks_definitions,
        "execution_metrics": ctx.execution_metrics,
        "tasks_metrics": ctx.tasks_metrics,
        "version": 1,
        "derived_from_version": 0,
        "created_at": now.clone(),
        "updated_at": now,
    });
    if let Some(parent) = &ctx.queued_from_run_id {
        record["queued_from_run_id"] = json!(parent);
    }
    record
}

/// Upsert the run record of `ctx`.
pub async fn persist(stack: &Stack, ctx: &ExecutionContext) -> Result<(), StackError> {
    stack
        .store
        .upsert(
            &ctx.tenant_id,
            RUNS_COLLECTION,
            &json!({ "id": ctx.run_id }),
            run_record(ctx),
        )
        .await?;
    tracing::debug!(run_id = %ctx.run_id, "Persisted run record");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use execustack_tasks::ExecutionDefinition;

    #[tokio::test]
    async fn test_persist_upserts_by_run_id() {
        let stack = Stack::in_memory();
        let mut ctx = ExecutionContext::new("acme", ExecutionDefinition::default());
        ctx.run_id = "es-executions~1".to_string();
        ctx.queued_from_run_id = Some("es-executions~0".to_string());

        persist(&stack, &ctx).await.unwrap();
        ctx.execution_metrics.is_success = false;
        persist(&stack, &ctx).await.unwrap();

        let rows = stack.store.query("acme", RUNS_COLLECTION, &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["execution_metrics"]["is_success"], json!(false));
        assert_eq!(rows[0]["queued_from_run_id"], json!("es-executions~0"));
        assert!(rows[0].get("tasks_results").is_none());
    }
}
