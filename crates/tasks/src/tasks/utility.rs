//! Context and string utilities.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_str;
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::{TaskFunction, TaskScope};
use crate::util::{random_string, sha256_hex, DEFAULT_RANDOM_LENGTH};

/// `util_add_context`: copies its evaluated params into its results so later
/// tasks can reference them.
pub struct AddContextTask;

#[async_trait]
impl TaskFunction for AddContextTask {
    fn name(&self) -> &'static str {
        "util_add_context"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        _scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        if let Value::Object(params) = &task.params {
            results.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        metrics.mark_success();
        Ok(())
    }
}

/// `util_string_to_hash`: hex SHA-256 of `string`.
pub struct StringToHashTask;

#[async_trait]
impl TaskFunction for StringToHashTask {
    fn name(&self) -> &'static str {
        "util_string_to_hash"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        _scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let input = require_str(task, "string")?;
        results.insert("hash".to_string(), json!(sha256_hex(input)));
        metrics.mark_success();
        Ok(())
    }
}

/// `util_random_string`: random hex string of `length` characters.
pub struct RandomStringTask;

#[async_trait]
impl TaskFunction for RandomStringTask {
    fn name(&self) -> &'static str {
        "util_random_string"
    }

    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        _scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let length = match task.param("length") {
            None => DEFAULT_RANDOM_LENGTH,
            Some(v) => v
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or(TaskError::InvalidDefinition)? as usize,
        };
        results.insert("random_string".to_string(), json!(random_string(length)));
        metrics.mark_success();
        Ok(())
    }
}
