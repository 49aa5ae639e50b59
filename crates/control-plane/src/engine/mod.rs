//! Run execution engine.
//!
//! - **Orchestrator**: orders, evaluates, executes and compensates the tasks of a run
//! - **Dispatch**: publishes deferred tasks and optional per-task results
//! - **Record**: the persisted run record

pub mod dispatch;
pub mod orchestrator;
pub mod record;

pub use dispatch::Dispatcher;
pub use orchestrator::Orchestrator;
pub use record::RUNS_COLLECTION;
