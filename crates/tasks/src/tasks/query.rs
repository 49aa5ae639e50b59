//! Read-only query over a collection.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_str;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};

/// `db_query`: runs `pipeline` over `collection_name`.
///
/// With `is_single` the result is capped to one and returned as an object
/// or null instead of an array.
pub struct QueryTask;

#[async_trait]
impl TaskFunction for QueryTask {
    fn name(&self) -> &'static str {
        "db_query"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let collection = require_str(task, "collection_name")?;
        let mut pipeline = task
            .param("pipeline")
            .and_then(Value::as_array)
            .cloned()
            .ok_or(TaskError::InvalidDefinition)?;
        let is_single = task.param("is_single").map(crate::definition::is_truthy).unwrap_or(false);

        if is_single {
            pipeline.push(json!({ "$limit": 1 }));
        }

        let mut rows = scope
            .stack
            .store
            .query(scope.tenant_id, collection, &pipeline)
            .await?;

        let data = if is_single {
            rows.pop().unwrap_or(Value::Null)
        } else {
            Value::Array(rows)
        };
        results.insert("data".to_string(), data);

        metrics.mark_success();
        Ok(())
    }
}
