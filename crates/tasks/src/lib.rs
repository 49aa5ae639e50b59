//! ExecuStack Task Library
//!
//! Task functions and run-state types shared by the control plane and the
//! worker pool.
//!
//! This crate provides:
//! - Task function framework with registry pattern
//! - Built-in functions: document CRUD with versioning, credentials,
//!   realtime namespaces, broker publishing, string utilities
//! - Template evaluator (minijinja text templates and `[[expr]]` expressions)
//! - Capability interfaces for the store, cache, locks, broker and realtime
//!   channel, with in-memory implementations

pub mod compensation;
pub mod context;
pub mod definition;
pub mod error;
pub mod lock;
pub mod registry;
pub mod stack;
pub mod tasks;
pub mod template;
pub mod tokens;
pub mod util;
pub mod versioning;

pub use compensation::{Compensation, CompensationAction};
pub use context::{ErrorKind, ExecutionContext, ExecutionMetrics, TaskMetrics, TaskResults};
pub use definition::{DeferredExecution, ExecutionDefinition, IndexedTasks, TaskDefinition, Validation};
pub use error::{StackError, TaskError, TemplateError};
pub use registry::{TaskFunction, TaskRegistry, TaskScope};
pub use stack::{Destination, ExchangeKind, Stack, StackSettings};
pub use tasks::create_default_registry;
pub use template::Evaluator;
pub use tokens::{Claims, TokenIssuer};
