//! Task function registry and dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::compensation::{Compensation, CompensationAction};
use crate::context::{TaskMetrics, TaskResults};
use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::stack::Stack;

/// What a task function may see of its run besides its own metrics/results.
pub struct TaskScope<'a> {
    pub tenant_id: &'a str,
    pub run_id: &'a str,
    pub task_name: &'a str,
    pub stack: &'a Stack,
    compensations: &'a mut Vec<Compensation>,
}

impl<'a> TaskScope<'a> {
    pub fn new(
        tenant_id: &'a str,
        run_id: &'a str,
        task_name: &'a str,
        stack: &'a Stack,
        compensations: &'a mut Vec<Compensation>,
    ) -> Self {
        Self {
            tenant_id,
            run_id,
            task_name,
            stack,
            compensations,
        }
    }

    /// Register a compensating action for the current task.
    pub fn compensate(&mut self, action: CompensationAction) {
        tracing::debug!(task = %self.task_name, ?action, "Registered compensation");
        self.compensations.push(Compensation {
            task_name: self.task_name.to_string(),
            action,
        });
    }

    /// Number of compensations registered so far in the run.
    pub fn compensation_count(&self) -> usize {
        self.compensations.len()
    }
}

/// A named, side-effecting operation invoked by the orchestrator.
///
/// Implementations set `metrics.is_success` and write into `results`;
/// returning `Err` signals failure.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    /// Returns the function's registered name.
    fn name(&self) -> &'static str;

    /// Execute the function for one evaluated task definition.
    async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError>;
}

/// Registry of available task functions.
pub struct TaskRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a task function.
    pub fn register<F: TaskFunction + 'static>(&mut self, function: F) {
        let name = function.name().to_string();
        self.functions.insert(name, Arc::new(function));
    }

    /// Get a function by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions.get(name).cloned()
    }

    /// Check if a function is registered.
    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// List all registered function names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a function by name.
    pub async fn execute(
        &self,
        task: &TaskDefinition,
        metrics: &mut TaskMetrics,
        results: &mut TaskResults,
        scope: &mut TaskScope<'_>,
    ) -> Result<(), TaskError> {
        let function = self
            .get(&task.function)
            .ok_or_else(|| TaskError::UnknownFunction(task.function.clone()))?;
        function.execute(task, metrics, results, scope).await
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("functions", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockFunction;

    #[async_trait]
    impl TaskFunction for MockFunction {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn execute(
            &self,
            _task: &TaskDefinition,
            metrics: &mut TaskMetrics,
            results: &mut TaskResults,
            scope: &mut TaskScope<'_>,
        ) -> Result<(), TaskError> {
            results.insert("tenant".to_string(), serde_json::json!(scope.tenant_id));
            scope.compensate(CompensationAction::MarkReverted);
            metrics.mark_success();
            Ok(())
        }
    }

    #[test]
    fn test_registry_register() {
        let mut registry = TaskRegistry::new();
        registry.register(MockFunction);

        assert!(registry.has("mock"));
        assert!(!registry.has("unknown"));
        assert_eq!(registry.list(), vec!["mock"]);
    }

    #[tokio::test]
    async fn test_registry_execute() {
        let mut registry = TaskRegistry::new();
        registry.register(MockFunction);

        let stack = Stack::in_memory();
        let mut compensations = Vec::new();
        let mut scope = TaskScope::new("acme", "es-executions~1", "t", &stack, &mut compensations);
        let mut metrics = TaskMetrics::default();
        let mut results = TaskResults::new();
        let task = TaskDefinition::new("mock", serde_json::json!({}));

        registry
            .execute(&task, &mut metrics, &mut results, &mut scope)
            .await
            .unwrap();

        assert!(metrics.succeeded());
        assert_eq!(results["tenant"], serde_json::json!("acme"));
        assert_eq!(compensations.len(), 1);
        assert_eq!(compensations[0].task_name, "t");
    }

    #[tokio::test]
    async fn test_registry_execute_unknown() {
        let registry = TaskRegistry::new();
        let stack = Stack::in_memory();
        let mut compensations = Vec::new();
        let mut scope = TaskScope::new("acme", "r", "t", &stack, &mut compensations);
        let task = TaskDefinition::new("nope", serde_json::json!({}));

        let result = registry
            .execute(&task, &mut TaskMetrics::default(), &mut TaskResults::new(), &mut scope)
            .await;
        assert!(matches!(result, Err(TaskError::UnknownFunction(ref f)) if f == "nope"));
    }
}
