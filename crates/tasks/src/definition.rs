//! Execution and task definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Declarative input of a run: an ordered set of named tasks.
///
/// Declaration order is kept by [`IndexedTasks`] and serves as the sort
/// tie-break between tasks with equal `execution_order`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionDefinition {
    /// Task name -> definition.
    #[serde(default)]
    pub tasks_definitions: IndexedTasks,

    /// Run id of the run that deferred this definition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_from_run_id: Option<String>,
}

/// Task definitions keyed by name, remembering declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexedTasks {
    entries: Vec<(String, TaskDefinition)>,
}

impl IndexedTasks {
    /// Insert or replace a task, keeping the original slot on replace.
    pub fn insert(&mut self, name: impl Into<String>, task: TaskDefinition) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = task,
            None => self.entries.push((name, task)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskDefinition)> {
        self.entries.iter().map(|(n, t)| (n, t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut TaskDefinition)> {
        self.entries.iter_mut().map(|(n, t)| (&*n, t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for IndexedTasks {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, task) in &self.entries {
            map.serialize_entry(name, task)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for IndexedTasks {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TasksVisitor;

        impl<'de> serde::de::Visitor<'de> for TasksVisitor {
            type Value = IndexedTasks;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of task name to task definition")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(
                self,
                mut access: A,
            ) -> Result<Self::Value, A::Error> {
                let mut tasks = IndexedTasks::default();
                while let Some((name, task)) = access.next_entry::<String, TaskDefinition>()? {
                    tasks.insert(name, task);
                }
                Ok(tasks)
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(IndexedTasks::default())
            }
        }

        deserializer.deserialize_any(TasksVisitor)
    }
}

impl FromIterator<(String, TaskDefinition)> for IndexedTasks {
    fn from_iter<I: IntoIterator<Item = (String, TaskDefinition)>>(iter: I) -> Self {
        let mut tasks = IndexedTasks::default();
        for (name, task) in iter {
            tasks.insert(name, task);
        }
        tasks
    }
}

/// One task inside an execution definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name (defaults to the map key).
    #[serde(default)]
    pub name: String,

    /// Registered task function name.
    #[serde(default)]
    pub function: String,

    /// Ascending execution order; `None` runs last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<u64>,

    /// Function parameters, templates allowed at any depth.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_validations: Vec<Validation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_validations: Vec<Validation>,

    /// Failure of a non-essential task does not abort the run.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_non_essential: bool,

    /// Results are stripped from the returned and persisted view.
    #[serde(
        default,
        alias = "is_secret_task_results",
        skip_serializing_if = "is_false"
    )]
    pub is_secret_results: bool,

    /// Defer to the tenant's point-to-point queue.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_queue: bool,

    /// Defer to the tenant's fanout exchange.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_broadcast: bool,

    /// Message recorded when this essential task aborts the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TaskDefinition {
    /// Create a task definition for a function with params.
    pub fn new(function: impl Into<String>, params: Value) -> Self {
        Self {
            function: function.into(),
            params,
            ..Default::default()
        }
    }

    /// Set the execution order.
    pub fn with_order(mut self, order: u64) -> Self {
        self.execution_order = Some(order);
        self
    }

    /// Mark the task as non-essential.
    pub fn non_essential(mut self) -> Self {
        self.is_non_essential = true;
        self
    }

    pub fn is_essential(&self) -> bool {
        !self.is_non_essential
    }

    pub fn is_deferred(&self) -> bool {
        self.is_queue || self.is_broadcast
    }

    /// Effective order used for sorting.
    pub fn order_key(&self) -> u64 {
        self.execution_order.unwrap_or(u64::MAX)
    }

    /// Message used when this task aborts the run.
    pub fn failure_message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| format!("Error: {}", self.name))
    }

    /// Reduced `{name, function}` form kept past the run.
    pub fn reduced(&self) -> TaskDefinition {
        TaskDefinition {
            name: self.name.clone(),
            function: self.function.clone(),
            ..Default::default()
        }
    }

    /// Look up a parameter by key.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    /// Look up a non-empty string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// A pre- or post-validation guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    /// Literal value or template; must be truthy after evaluation.
    pub expression: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Returns the first failing validation, if any.
pub fn first_failed(validations: &[Validation]) -> Option<&Validation> {
    validations.iter().find(|v| !is_truthy(&v.expression))
}

/// JSON truthiness: `null`, `false`, `0` and `""` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Message payload of a task deferred to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredExecution {
    pub queued_from_run_id: String,
    pub tasks_definitions: BTreeMap<String, TaskDefinition>,
}

impl DeferredExecution {
    /// Wrap a single evaluated task.
    pub fn single(run_id: &str, task: TaskDefinition) -> Self {
        let mut tasks_definitions = BTreeMap::new();
        tasks_definitions.insert(task.name.clone(), task);
        Self {
            queued_from_run_id: run_id.to_string(),
            tasks_definitions,
        }
    }

    /// Convert into a definition runnable in-process, clearing deferral flags.
    pub fn into_definition(self) -> ExecutionDefinition {
        let tasks_definitions = self
            .tasks_definitions
            .into_iter()
            .map(|(name, mut task)| {
                task.is_queue = false;
                task.is_broadcast = false;
                (name, task)
            })
            .collect();

        ExecutionDefinition {
            tasks_definitions,
            queued_from_run_id: Some(self.queued_from_run_id),
        }
    }
}
