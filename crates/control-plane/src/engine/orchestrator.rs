//! Run orchestration engine.
//!
//! Drives one execution definition to completion:
//! - Orders tasks by `execution_order`, declaration order breaking ties
//! - Evaluates each task's templates against the live run context
//! - Executes through the task registry, recording metrics and results
//! - Replays compensations in reverse on abort
//! - Hands deferred tasks to the dispatcher and persists the run record

use std::sync::Arc;

use tracing::{debug, info, warn};

use execustack_tasks::definition::{first_failed, ExecutionDefinition, TaskDefinition, Validation};
use execustack_tasks::util::{generate_document_id, PrecisionTimer};
use execustack_tasks::{
    Compensation, CompensationAction, ErrorKind, Evaluator, ExecutionContext, Stack, TaskError,
    TaskRegistry, TaskResults, TaskScope,
};

use super::dispatch::Dispatcher;
use super::record::{self, RUNS_COLLECTION};
use crate::result_ext::ResultExt;

/// Why a run stopped before its last task.
#[derive(Debug, Clone, PartialEq)]
struct Abort {
    kind: ErrorKind,
    message: String,
}

impl Abort {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure class of a task function error.
fn classify(error: &TaskError) -> ErrorKind {
    match error {
        e if e.is_conflict() => ErrorKind::Conflict,
        TaskError::InvalidDefinition | TaskError::UnknownFunction(_) => ErrorKind::Definition,
        _ => ErrorKind::TaskExecution,
    }
}

/// Executes runs against a shared [`Stack`].
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    evaluator: Evaluator,
    stack: Stack,
    dispatcher: Dispatcher,
    publish_results: bool,
}

impl Orchestrator {
    pub fn new(registry: Arc<TaskRegistry>, stack: Stack) -> Self {
        let dispatcher = Dispatcher::new(stack.broker.clone());
        Self {
            registry,
            evaluator: Evaluator::new(),
            stack,
            dispatcher,
            publish_results: false,
        }
    }

    /// Publish each task's non-secret results to its function's exchange.
    pub fn with_publish_results(mut self, enabled: bool) -> Self {
        self.publish_results = enabled;
        self
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Run `definition` for `tenant_id`.
    ///
    /// Never fails: the outcome is recorded in the returned context's
    /// `execution_metrics`, and the run record is persisted either way.
    pub async fn execute(&self, tenant_id: &str, definition: ExecutionDefinition) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(tenant_id, definition);
        for (key, task) in ctx.execution_definition.tasks_definitions.iter_mut() {
            if task.name.is_empty() {
                task.name = key.clone();
            }
        }
        ctx.run_id = self.new_run_id(tenant_id).await;

        let timer = PrecisionTimer::start(ctx.run_id.as_str());
        info!(
            run_id = %ctx.run_id,
            tenant_id = %tenant_id,
            tasks = ctx.execution_definition.tasks_definitions.len(),
            "Starting run"
        );

        match self.run_tasks(&mut ctx, &timer).await {
            Ok(()) => {
                self.finalize(&mut ctx);
                self.dispatcher.dispatch(&ctx).await;
            }
            Err(abort) => {
                warn!(run_id = %ctx.run_id, kind = ?abort.kind, message = %abort.message, "Run aborted");
                ctx.fail(abort.kind, abort.message);
                self.finalize(&mut ctx);
                self.compensate(&mut ctx).await;
            }
        }

        ctx.execution_metrics.execution_time_ms = Some(timer.stop());
        let _ = record::persist(&self.stack, &ctx)
            .await
            .log(format!("persisting run record {}", ctx.run_id));

        info!(
            run_id = %ctx.run_id,
            is_success = ctx.execution_metrics.is_success,
            execution_time_ms = ?ctx.execution_metrics.execution_time_ms,
            "Run finished"
        );
        ctx
    }

    async fn new_run_id(&self, tenant_id: &str) -> String {
        match generate_document_id(self.stack.store.as_ref(), tenant_id, RUNS_COLLECTION).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Could not check run id, using unchecked id");
                format!("{}~{}", RUNS_COLLECTION, uuid::Uuid::new_v4())
            }
        }
    }

    /// Clone tasks in execution order, rejecting unknown functions.
    fn order(&self, definition: &ExecutionDefinition) -> Result<Vec<TaskDefinition>, Abort> {
        let mut tasks = Vec::with_capacity(definition.tasks_definitions.len());
        for (_, task) in definition.tasks_definitions.iter() {
            if !self.registry.has(&task.function) {
                let error = TaskError::UnknownFunction(task.function.clone());
                return Err(Abort::new(ErrorKind::Definition, error.to_string()));
            }
            tasks.push(task.clone());
        }
        // stable: equal orders keep declaration order
        tasks.sort_by_key(TaskDefinition::order_key);
        Ok(tasks)
    }

    async fn run_tasks(&self, ctx: &mut ExecutionContext, timer: &PrecisionTimer) -> Result<(), Abort> {
        let ordered = self.order(&ctx.execution_definition)?;
        for task in &ordered {
            ctx.tasks_metrics.insert(task.name.clone(), Default::default());
        }
        for task in &ordered {
            self.run_task(ctx, task, timer).await?;
        }
        Ok(())
    }

    async fn run_task(
        &self,
        ctx: &mut ExecutionContext,
        original: &TaskDefinition,
        timer: &PrecisionTimer,
    ) -> Result<(), Abort> {
        let name = original.name.clone();
        let task = self
            .evaluate_task(ctx, original)
            .map_err(|e| Abort::new(ErrorKind::Definition, format!("Error: {}: {}", name, e)))?;
        ctx.evaluated_tasks_definitions.insert(name.clone(), task.clone());

        if let Some(failed) = first_failed(&task.pre_validations) {
            let message = validation_message(failed, &task, "pre");
            if task.is_essential() {
                return Err(Abort::new(ErrorKind::Precondition, message));
            }
            debug!(run_id = %ctx.run_id, task = %name, "Pre-validation failed, skipping task");
            return Ok(());
        }

        if task.is_deferred() {
            if let Some(metrics) = ctx.tasks_metrics.get_mut(&name) {
                metrics.is_attempted = false;
                metrics.is_deferred = Some(true);
            }
            debug!(run_id = %ctx.run_id, task = %name, broadcast = task.is_broadcast, "Task deferred");
            ctx.deferred_tasks.push(task);
            return Ok(());
        }

        let mut metrics = ctx.tasks_metrics.remove(&name).unwrap_or_default();
        metrics.ms_since_run_start = Some(timer.tick(&name));
        metrics.is_attempted = true;
        ctx.compensations.push(Compensation {
            task_name: name.clone(),
            action: CompensationAction::MarkReverted,
        });

        let mut results = TaskResults::new();
        let started = PrecisionTimer::start(name.as_str());
        let outcome = {
            let mut scope = TaskScope::new(
                &ctx.tenant_id,
                &ctx.run_id,
                &name,
                &self.stack,
                &mut ctx.compensations,
            );
            self.registry
                .execute(&task, &mut metrics, &mut results, &mut scope)
                .await
        };
        metrics.execution_time_ms = Some(started.stop());
        if let Err(e) = &outcome {
            metrics.is_success = Some(false);
            metrics.error_message = Some(e.to_string());
        }
        let succeeded = metrics.succeeded();
        ctx.tasks_metrics.insert(name.clone(), metrics);
        ctx.tasks_results.insert(name.clone(), results);

        if !succeeded {
            let kind = outcome.as_ref().err().map(classify).unwrap_or(ErrorKind::TaskExecution);
            let always_fatal = matches!(kind, ErrorKind::Conflict | ErrorKind::Definition);
            if task.is_essential() || always_fatal {
                let message = match (&task.error_message, &outcome) {
                    (Some(message), _) => message.clone(),
                    (None, Err(e)) if e.is_conflict() => e.to_string(),
                    _ => task.failure_message(),
                };
                return Err(Abort::new(kind, message));
            }
            warn!(run_id = %ctx.run_id, task = %name, "Non-essential task failed");
            return Ok(());
        }
        debug!(run_id = %ctx.run_id, task = %name, "Task succeeded");

        if !original.post_validations.is_empty() {
            let validations = self
                .evaluate_validations(ctx, &original.post_validations)
                .map_err(|e| Abort::new(ErrorKind::Definition, format!("Error: {}: {}", name, e)))?;
            if let Some(failed) = first_failed(&validations) {
                let message = validation_message(failed, &task, "post");
                if task.is_essential() {
                    return Err(Abort::new(ErrorKind::Postcondition, message));
                }
                warn!(run_id = %ctx.run_id, task = %name, "Post-validation failed on non-essential task");
            }
        }

        if self.publish_results && !task.is_secret_results {
            if let Some(results) = ctx.tasks_results.get(&name) {
                self.dispatcher
                    .publish_results(&ctx.tenant_id, &task.function, results)
                    .await;
            }
        }
        Ok(())
    }

    /// Evaluate a copy of `original` against the current context.
    ///
    /// Post-validations are left untouched: they may reference this task's
    /// own results, which only exist after it runs.
    fn evaluate_task(
        &self,
        ctx: &ExecutionContext,
        original: &TaskDefinition,
    ) -> Result<TaskDefinition, TaskError> {
        let mut template = original.clone();
        template.post_validations.clear();

        let evaluated = self
            .evaluator
            .evaluate_value(&serde_json::to_value(&template)?, &ctx.to_template_context())?;
        let mut task: TaskDefinition = serde_json::from_value(evaluated)?;
        task.name = original.name.clone();
        task.function = original.function.clone();
        task.post_validations = original.post_validations.clone();
        Ok(task)
    }

    fn evaluate_validations(
        &self,
        ctx: &ExecutionContext,
        validations: &[Validation],
    ) -> Result<Vec<Validation>, TaskError> {
        let evaluated = self
            .evaluator
            .evaluate_value(&serde_json::to_value(validations)?, &ctx.to_template_context())?;
        Ok(serde_json::from_value(evaluated)?)
    }

    /// Strip secret results and reduce definitions to `{name, function}`.
    fn finalize(&self, ctx: &mut ExecutionContext) {
        for (_, task) in ctx.execution_definition.tasks_definitions.iter() {
            if task.is_secret_results {
                ctx.tasks_results.remove(&task.name);
            }
        }
        for (_, task) in ctx.execution_definition.tasks_definitions.iter_mut() {
            *task = task.reduced();
        }
        for (_, task) in ctx.evaluated_tasks_definitions.iter_mut() {
            *task = task.reduced();
        }
    }

    /// Replay compensations newest first; each one runs regardless of the
    /// others' outcome.
    async fn compensate(&self, ctx: &mut ExecutionContext) {
        let compensations = std::mem::take(&mut ctx.compensations);
        info!(run_id = %ctx.run_id, count = compensations.len(), "Replaying compensations");

        for compensation in compensations.iter().rev() {
            match &compensation.action {
                CompensationAction::MarkReverted => {
                    if let Some(metrics) = ctx.tasks_metrics.get_mut(&compensation.task_name) {
                        metrics.is_reverted = Some(true);
                    }
                    if let Some(results) = ctx.tasks_results.get_mut(&compensation.task_name) {
                        results.clear();
                    }
                }
                action => {
                    debug!(run_id = %ctx.run_id, task = %compensation.task_name, ?action, "Compensating");
                    let _ = compensation
                        .apply(&ctx.tenant_id, &self.stack)
                        .await
                        .log(format!("compensating task {}", compensation.task_name));
                }
            }
        }
        ctx.compensations = compensations;
    }
}

fn validation_message(failed: &Validation, task: &TaskDefinition, phase: &str) -> String {
    failed
        .error_message
        .clone()
        .or_else(|| task.error_message.clone())
        .unwrap_or_else(|| format!("Error: {} {}-validation failed", task.name, phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use execustack_tasks::create_default_registry;
    use execustack_tasks::stack::memory::MemoryBroker;
    use execustack_tasks::stack::{execution_exchange, execution_queue};
    use execustack_tasks::{ExchangeKind, Destination, TaskFunction, TaskMetrics};
    use serde_json::{json, Value};

    /// Fails every call with the message given in `params.message`.
    struct FailingTask;

    #[async_trait]
    impl TaskFunction for FailingTask {
        fn name(&self) -> &'static str {
            "test_fail"
        }

        async fn execute(
            &self,
            task: &TaskDefinition,
            _metrics: &mut TaskMetrics,
            _results: &mut TaskResults,
            _scope: &mut TaskScope<'_>,
        ) -> Result<(), TaskError> {
            let message = task.param_str("message").unwrap_or("boom");
            Err(TaskError::ExecutionFailed(message.to_string()))
        }
    }

    fn orchestrator_with(stack: Stack) -> Orchestrator {
        let mut registry = create_default_registry();
        registry.register(FailingTask);
        Orchestrator::new(Arc::new(registry), stack)
    }

    fn definition(tasks: Value) -> ExecutionDefinition {
        serde_json::from_value(json!({ "tasks_definitions": tasks })).unwrap()
    }

    async fn live_doc(stack: &Stack, collection: &str, id: &str) -> Option<Value> {
        stack
            .store
            .find_one("acme", collection, &json!({ "id": id }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_orders_by_execution_order_then_declaration() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "unordered": { "function": "util_add_context", "params": { "v": 1 } },
                    "second_b": { "function": "util_add_context", "execution_order": 2 },
                    "first": { "function": "util_add_context", "execution_order": 1 },
                    "second_a": { "function": "util_add_context", "execution_order": 2 }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        let start = |name: &str| ctx.tasks_metrics[name].ms_since_run_start.unwrap();
        assert!(start("first") <= start("second_b"));
        assert!(start("second_b") <= start("second_a"));
        assert!(start("second_a") <= start("unordered"));
        assert_eq!(ctx.tasks_results["unordered"]["v"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_function_rejects_before_running() {
        let stack = Stack::in_memory();
        let orchestrator = orchestrator_with(stack.clone());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "create": {
                        "function": "db_create_doc",
                        "execution_order": 1,
                        "params": { "collection_name": "users", "payload": { "name": "a" } }
                    },
                    "bogus": { "function": "does_not_exist", "execution_order": 2 }
                })),
            )
            .await;

        assert!(!ctx.execution_metrics.is_success);
        assert_eq!(ctx.execution_metrics.error_kind, Some(ErrorKind::Definition));
        assert!(ctx.tasks_metrics.is_empty());
        let users = stack.store.query("acme", "users", &[]).await.unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_templates_reference_earlier_results() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "create": {
                        "function": "db_create_doc",
                        "execution_order": 1,
                        "params": { "collection_name": "users", "payload": { "name": "Ada" } }
                    },
                    "echo": {
                        "function": "util_add_context",
                        "execution_order": 2,
                        "params": {
                            "id": "[[expr]]tasks_results.create.document.id",
                            "greeting": "Hello {{ tasks_results.create.document.name | upper }}"
                        }
                    }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        let created_id = ctx.tasks_results["create"]["document"]["id"].clone();
        assert!(created_id.as_str().unwrap().starts_with("users~"));
        assert_eq!(ctx.tasks_results["echo"]["id"], created_id);
        assert_eq!(ctx.tasks_results["echo"]["greeting"], json!("Hello ADA"));
    }

    #[tokio::test]
    async fn test_essential_failure_compensates_in_reverse() {
        let stack = Stack::in_memory();
        stack
            .store
            .replace("acme", "users", &json!({ "id": "users~1" }), json!({ "name": "before", "version": 1 }))
            .await
            .unwrap();
        let orchestrator = orchestrator_with(stack.clone());

        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "create": {
                        "function": "db_create_doc",
                        "execution_order": 1,
                        "params": { "collection_name": "orders", "payload": { "n": 1 } }
                    },
                    "update": {
                        "function": "db_update_doc",
                        "execution_order": 2,
                        "params": { "id": "users~1", "payload": { "name": "after" } }
                    },
                    "explode": {
                        "function": "test_fail",
                        "execution_order": 3,
                        "error_message": "checkout failed"
                    }
                })),
            )
            .await;

        assert!(!ctx.execution_metrics.is_success);
        assert_eq!(ctx.execution_metrics.error_message.as_deref(), Some("checkout failed"));
        assert_eq!(ctx.execution_metrics.error_kind, Some(ErrorKind::TaskExecution));

        // store side effects undone
        assert!(stack.store.query("acme", "orders", &[]).await.unwrap().is_empty());
        let user = live_doc(&stack, "users", "users~1").await.unwrap();
        assert_eq!(user["name"], json!("before"));
        assert_eq!(user["version"], json!(1));

        for name in ["create", "update", "explode"] {
            assert_eq!(ctx.tasks_metrics[name].is_reverted, Some(true), "{}", name);
            assert!(ctx.tasks_results[name].is_empty(), "{}", name);
        }
        assert_eq!(
            ctx.tasks_metrics["explode"].error_message.as_deref(),
            Some("Execution failed: boom")
        );

        let replayed: Vec<_> = ctx.compensations.iter().map(|c| c.task_name.as_str()).collect();
        assert_eq!(replayed.first(), Some(&"create"));
        assert_eq!(replayed.last(), Some(&"explode"));
    }

    #[tokio::test]
    async fn test_non_essential_failure_continues() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "optional": {
                        "function": "test_fail",
                        "execution_order": 1,
                        "is_non_essential": true,
                        "post_validations": [{ "expression": false }]
                    },
                    "after": { "function": "util_add_context", "execution_order": 2, "params": { "ok": true } }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        assert_eq!(ctx.tasks_metrics["optional"].is_success, Some(false));
        assert_eq!(ctx.tasks_results["after"]["ok"], json!(true));
        assert!(ctx.tasks_metrics["optional"].is_reverted.is_none());
    }

    #[tokio::test]
    async fn test_conflict_is_fatal_even_when_non_essential() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "delete": {
                        "function": "db_delete_doc",
                        "is_non_essential": true,
                        "params": { "id": "users~missing" }
                    }
                })),
            )
            .await;

        assert!(!ctx.execution_metrics.is_success);
        assert_eq!(ctx.execution_metrics.error_kind, Some(ErrorKind::Conflict));
        assert_eq!(ctx.execution_metrics.error_message.as_deref(), Some("document not found"));
    }

    #[tokio::test]
    async fn test_pre_validation_gates_task() {
        let orchestrator = orchestrator_with(Stack::in_memory());

        let skipped = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "maybe": {
                        "function": "util_add_context",
                        "is_non_essential": true,
                        "pre_validations": [{ "expression": "[[expr]]1 > 2" }]
                    }
                })),
            )
            .await;
        assert!(skipped.execution_metrics.is_success);
        assert!(!skipped.tasks_metrics["maybe"].is_attempted);
        assert!(skipped.tasks_results.get("maybe").is_none());

        let aborted = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "must": {
                        "function": "util_add_context",
                        "pre_validations": [{ "expression": "", "error_message": "not allowed" }]
                    }
                })),
            )
            .await;
        assert!(!aborted.execution_metrics.is_success);
        assert_eq!(aborted.execution_metrics.error_kind, Some(ErrorKind::Precondition));
        assert_eq!(aborted.execution_metrics.error_message.as_deref(), Some("not allowed"));
    }

    #[tokio::test]
    async fn test_reading_skipped_task_results_skips_dependent() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "maybe": {
                        "function": "util_add_context",
                        "execution_order": 1,
                        "is_non_essential": true,
                        "params": { "id": "x" },
                        "pre_validations": [{ "expression": "[[expr]]1 > 2" }]
                    },
                    "follow_up": {
                        "function": "util_add_context",
                        "execution_order": 2,
                        "is_non_essential": true,
                        "params": { "id": "[[expr]]tasks_results.maybe.id" },
                        "pre_validations": [{ "expression": "[[expr]]tasks_results.maybe.id" }]
                    },
                    "last": { "function": "util_add_context", "execution_order": 3 }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        assert!(!ctx.tasks_metrics["maybe"].is_attempted);
        assert!(!ctx.tasks_metrics["follow_up"].is_attempted);
        assert!(ctx.tasks_metrics["last"].is_attempted);
        assert!(ctx.tasks_results.get("follow_up").is_none());
    }

    #[tokio::test]
    async fn test_post_validation_sees_own_results() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "check": {
                        "function": "util_add_context",
                        "params": { "count": 0 },
                        "post_validations": [{ "expression": "[[expr]]tasks_results.check.count > 0" }]
                    }
                })),
            )
            .await;

        assert!(!ctx.execution_metrics.is_success);
        assert_eq!(ctx.execution_metrics.error_kind, Some(ErrorKind::Postcondition));
        assert_eq!(
            ctx.execution_metrics.error_message.as_deref(),
            Some("Error: check post-validation failed")
        );
        assert_eq!(ctx.tasks_metrics["check"].is_reverted, Some(true));
    }

    #[tokio::test]
    async fn test_secret_results_stripped_and_definitions_reduced() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "secret": {
                        "function": "util_add_context",
                        "is_secret_task_results": true,
                        "params": { "password": "hunter2" }
                    }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        assert!(ctx.tasks_results.get("secret").is_none());
        let reduced = json!({ "name": "secret", "function": "util_add_context" });
        let evaluated = ctx.evaluated_tasks_definitions.get("secret").unwrap();
        assert_eq!(serde_json::to_value(evaluated).unwrap(), reduced);
        let declared = ctx.execution_definition.tasks_definitions.get("secret").unwrap();
        assert_eq!(serde_json::to_value(declared).unwrap(), reduced);
    }

    #[tokio::test]
    async fn test_deferred_tasks_dispatched_after_success() {
        let broker = Arc::new(MemoryBroker::new());
        let orchestrator = orchestrator_with(Stack::in_memory().with_broker(broker.clone()));
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "seed": { "function": "util_add_context", "execution_order": 1, "params": { "n": 7 } },
                    "later": {
                        "function": "util_add_context",
                        "execution_order": 2,
                        "is_queue": true,
                        "params": { "n": "[[expr]]tasks_results.seed.n" }
                    },
                    "everyone": { "function": "util_add_context", "is_broadcast": true }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        assert_eq!(ctx.tasks_metrics["later"].is_deferred, Some(true));
        assert!(!ctx.tasks_metrics["later"].is_attempted);

        let published = broker.published().await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, execution_queue("acme"));
        assert_eq!(published[0].1["queued_from_run_id"], json!(ctx.run_id));
        assert_eq!(published[0].1["tasks_definitions"]["later"]["params"]["n"], json!(7));
        assert_eq!(published[1].0, execution_exchange("acme"));
    }

    #[tokio::test]
    async fn test_update_then_broadcast_emit_without_namespace() {
        let broker = Arc::new(MemoryBroker::new());
        let stack = Stack::in_memory().with_broker(broker.clone());
        stack
            .store
            .replace("acme", "users", &json!({ "id": "users~1" }), json!({ "name": "before", "version": 1 }))
            .await
            .unwrap();
        let orchestrator = orchestrator_with(stack.clone());

        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "update": {
                        "function": "db_update_doc",
                        "execution_order": 1,
                        "params": { "id": "users~1", "payload": { "name": "after" } }
                    },
                    "notify": {
                        "function": "ws_emit_event",
                        "execution_order": 2,
                        "is_broadcast": true,
                        "params": {
                            "namespace": "users",
                            "rooms": [""],
                            "event": "updated",
                            "payload": "[[expr]]tasks_results.update.document"
                        }
                    },
                    "notify_here": {
                        "function": "ws_emit_event",
                        "execution_order": 3,
                        "params": { "namespace": "users", "rooms": [""], "event": "updated" }
                    }
                })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
        assert_eq!(live_doc(&stack, "users", "users~1").await.unwrap()["name"], json!("after"));
        assert_eq!(ctx.tasks_metrics["notify"].is_deferred, Some(true));
        assert!(ctx.tasks_metrics["notify_here"].succeeded());
        assert_eq!(ctx.tasks_results["notify_here"]["emitted"], json!(0));

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, execution_exchange("acme"));
        assert_eq!(
            published[0].1["tasks_definitions"]["notify"]["params"]["payload"]["name"],
            json!("after")
        );
    }

    #[tokio::test]
    async fn test_deferred_tasks_dropped_on_failure() {
        let broker = Arc::new(MemoryBroker::new());
        let orchestrator = orchestrator_with(Stack::in_memory().with_broker(broker.clone()));
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({
                    "later": { "function": "util_add_context", "execution_order": 1, "is_queue": true },
                    "explode": { "function": "test_fail", "execution_order": 2 }
                })),
            )
            .await;

        assert!(!ctx.execution_metrics.is_success);
        assert_eq!(ctx.execution_metrics.error_message.as_deref(), Some("Error: explode"));
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_run_successful() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_failing(true);
        let orchestrator = orchestrator_with(Stack::in_memory().with_broker(broker));
        let ctx = orchestrator
            .execute(
                "acme",
                definition(json!({ "later": { "function": "util_add_context", "is_queue": true } })),
            )
            .await;

        assert!(ctx.execution_metrics.is_success);
    }

    #[tokio::test]
    async fn test_publish_results_skips_secret_tasks() {
        let broker = Arc::new(MemoryBroker::new());
        let orchestrator = orchestrator_with(Stack::in_memory().with_broker(broker.clone()))
            .with_publish_results(true);
        orchestrator
            .execute(
                "acme",
                definition(json!({
                    "open": { "function": "util_add_context", "execution_order": 1, "params": { "a": 1 } },
                    "hidden": {
                        "function": "util_string_to_hash",
                        "execution_order": 2,
                        "is_secret_results": true,
                        "params": { "string": "x" }
                    }
                })),
            )
            .await;

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].0,
            Destination::Exchange {
                name: "results.acme.util_add_context".to_string(),
                kind: ExchangeKind::Fanout,
                routing_key: None,
            }
        );
        assert_eq!(published[0].1, json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn test_run_record_persisted_either_way() {
        let stack = Stack::in_memory();
        let orchestrator = orchestrator_with(stack.clone());

        let ok = orchestrator
            .execute("acme", definition(json!({ "a": { "function": "util_add_context" } })))
            .await;
        let failed = orchestrator
            .execute("acme", definition(json!({ "b": { "function": "test_fail" } })))
            .await;

        let ok_record = live_doc(&stack, RUNS_COLLECTION, &ok.run_id).await.unwrap();
        assert_eq!(ok_record["execution_metrics"]["is_success"], json!(true));
        assert!(ok_record["execution_metrics"]["execution_time_ms"].is_number());

        let failed_record = live_doc(&stack, RUNS_COLLECTION, &failed.run_id).await.unwrap();
        assert_eq!(failed_record["execution_metrics"]["is_success"], json!(false));
        assert_eq!(failed_record["tasks_metrics"]["b"]["is_reverted"], json!(true));
        assert_eq!(
            failed_record["execution_definition"]["tasks_definitions"]["b"],
            json!({ "name": "b", "function": "test_fail" })
        );
    }

    #[tokio::test]
    async fn test_empty_definition_succeeds() {
        let orchestrator = orchestrator_with(Stack::in_memory());
        let ctx = orchestrator.execute("acme", ExecutionDefinition::default()).await;
        assert!(ctx.execution_metrics.is_success);
        assert!(ctx.run_id.starts_with("es-executions~"));
    }
}
