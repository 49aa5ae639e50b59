//! Run context threaded through every task of a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::compensation::Compensation;
use crate::definition::{ExecutionDefinition, IndexedTasks, TaskDefinition};

/// Free-form results written by a task function.
pub type TaskResults = serde_json::Map<String, Value>;

/// Failure classes recorded on a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown function or malformed definition.
    Definition,
    /// Pre-validation failed.
    Precondition,
    /// Task function threw or reported failure.
    TaskExecution,
    /// Post-validation failed.
    Postcondition,
    /// Missing document/version or restore over a live document.
    Conflict,
}

/// Run-level metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub is_success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Per-task metrics, created for every task before the first one runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub is_attempted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms_since_run_start: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_reverted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deferred: Option<bool>,
}

impl TaskMetrics {
    pub fn succeeded(&self) -> bool {
        self.is_success.unwrap_or(false)
    }

    pub fn mark_success(&mut self) {
        self.is_success = Some(true);
    }
}

/// Mutable state of one run.
///
/// Owned by the orchestrator; task functions only see the pieces handed to
/// them through [`crate::registry::TaskScope`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Tenant the run belongs to.
    pub tenant_id: String,

    /// Generated run id (`es-executions~<uuid>`).
    pub run_id: String,

    /// Run that deferred this definition, when started by a consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_from_run_id: Option<String>,

    pub execution_definition: ExecutionDefinition,

    pub execution_metrics: ExecutionMetrics,

    #[serde(default)]
    pub tasks_metrics: BTreeMap<String, TaskMetrics>,

    #[serde(default)]
    pub tasks_results: BTreeMap<String, TaskResults>,

    #[serde(default)]
    pub evaluated_tasks_definitions: IndexedTasks,

    /// Compensations in registration order; replayed LIFO on abort.
    #[serde(skip)]
    pub compensations: Vec<Compensation>,

    /// Evaluated tasks handed to the dispatch adapter after a successful run.
    #[serde(skip)]
    pub deferred_tasks: Vec<TaskDefinition>,
}

impl ExecutionContext {
    /// Create a context for a tenant and definition.
    pub fn new(tenant_id: impl Into<String>, execution_definition: ExecutionDefinition) -> Self {
        let queued_from_run_id = execution_definition.queued_from_run_id.clone();
        Self {
            tenant_id: tenant_id.into(),
            queued_from_run_id,
            execution_definition,
            execution_metrics: ExecutionMetrics {
                is_success: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Record a run failure; the first failure wins.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.execution_metrics.is_success = false;
        if self.execution_metrics.error_message.is_none() {
            self.execution_metrics.error_message = Some(message.into());
            self.execution_metrics.error_kind = Some(kind);
        }
    }

    /// Results of a task, if it ran.
    pub fn results(&self, task_name: &str) -> Option<&TaskResults> {
        self.tasks_results.get(task_name)
    }

    /// Metrics of a task.
    pub fn metrics(&self, task_name: &str) -> Option<&TaskMetrics> {
        self.tasks_metrics.get(task_name)
    }

    /// Build the value templates are evaluated against.
    pub fn to_template_context(&self) -> Value {
        serde_json::json!({
            "client_settings": { "client_id": self.tenant_id },
            "tenant_id": self.tenant_id,
            "run_id": self.run_id,
            "queued_from_run_id": self.queued_from_run_id,
            "execution_definition": self.execution_definition,
            "execution_metrics": self.execution_metrics,
            "tasks_metrics": self.tasks_metrics,
            "tasks_results": self.tasks_results,
            "evaluated_tasks_definitions": self.evaluated_tasks_definitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_new_starts_successful() {
        let ctx = ExecutionContext::new("acme", ExecutionDefinition::default());
        assert!(ctx.execution_metrics.is_success);
        assert_eq!(ctx.tenant_id, "acme");
        assert!(ctx.compensations.is_empty());
    }

    #[test]
    fn test_first_failure_wins() {
        let mut ctx = ExecutionContext::new("acme", ExecutionDefinition::default());
        ctx.fail(ErrorKind::Precondition, "first");
        ctx.fail(ErrorKind::TaskExecution, "second");

        assert!(!ctx.execution_metrics.is_success);
        assert_eq!(ctx.execution_metrics.error_message.as_deref(), Some("first"));
        assert_eq!(ctx.execution_metrics.error_kind, Some(ErrorKind::Precondition));
    }

    #[test]
    fn test_template_context_exposes_results() {
        let mut ctx = ExecutionContext::new("acme", ExecutionDefinition::default());
        ctx.run_id = "es-executions~1".to_string();
        let mut results = TaskResults::new();
        results.insert("value".to_string(), json!(42));
        ctx.tasks_results.insert("first".to_string(), results);

        let tpl = ctx.to_template_context();
        assert_eq!(tpl["tasks_results"]["first"]["value"], json!(42));
        assert_eq!(tpl["client_settings"]["client_id"], json!("acme"));
        assert_eq!(tpl["run_id"], json!("es-executions~1"));
    }

    #[test]
    fn test_serialization_skips_internal_state() {
        let ctx = ExecutionContext::new("acme", ExecutionDefinition::default());
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("compensations").is_none());
        assert!(json.get("deferred_tasks").is_none());
        assert_eq!(json["execution_metrics"]["is_success"], json!(true));
    }

    #[test]
    fn test_task_metrics_defaults_unattempted() {
        let metrics = TaskMetrics::default();
        assert!(!metrics.is_attempted);
        assert!(!metrics.succeeded());
        assert_eq!(serde_json::to_value(&metrics).unwrap(), json!({"is_attempted": false}));
    }
}
