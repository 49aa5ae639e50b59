//! PostgreSQL adapters for the run stack.
//!
//! Documents, cache entries and leases each live in one table; tenant and
//! collection scoping is done by column.

pub mod cache;
pub mod locks;
pub mod pool;
pub mod schema;
pub mod store;

pub use cache::PgCache;
pub use locks::PgLockService;
pub use pool::{create_pool, health_check, DbPool};
pub use schema::migrate;
pub use store::PgDocumentStore;

use execustack_tasks::StackError;

/// Build a `StackError` constructor that tags a `sqlx::Error`.
pub(crate) fn stack_error(kind: fn(String) -> StackError) -> impl Fn(sqlx::Error) -> StackError {
    move |e| kind(e.to_string())
}
