//! Assembly of the run stack from configuration.

use std::sync::Arc;

use execustack_tasks::stack::Realtime;
use execustack_tasks::{Stack, TokenIssuer};

use crate::config::AppConfig;
use crate::db::{DbPool, PgCache, PgDocumentStore, PgLockService};
use crate::nats::NatsBroker;

/// Signing secret used when none is configured.
const DEV_TOKEN_SECRET: &str = "execustack-dev-secret";

/// Build the stack: PostgreSQL collaborators when a pool is given,
/// the NATS broker when a client is given, in-memory ones otherwise.
pub async fn build_stack(
    config: &AppConfig,
    pool: Option<DbPool>,
    nats: Option<async_nats::Client>,
    realtime: Arc<dyn Realtime>,
) -> Stack {
    let mut stack = Stack::in_memory();

    if let Some(pool) = pool {
        stack = stack
            .with_store(Arc::new(PgDocumentStore::new(pool.clone())))
            .with_cache(Arc::new(PgCache::new(pool.clone())))
            .with_locks(Arc::new(PgLockService::new(pool)));
    } else {
        tracing::warn!("Using in-memory store, cache and locks; state is lost on exit");
    }

    if let Some(client) = nats {
        match NatsBroker::new(client).await {
            Ok(broker) => stack = stack.with_broker(Arc::new(broker)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to set up NATS broker, deferred tasks stay in-process")
            }
        }
    }

    let secret = config.token_secret.clone().unwrap_or_else(|| {
        tracing::warn!("EXECUSTACK_TOKEN_SECRET not set, using development secret");
        DEV_TOKEN_SECRET.to_string()
    });
    let tokens = TokenIssuer::new(stack.cache.clone(), &secret)
        .with_default_expiry(config.token_default_expiry());

    stack
        .with_tokens(tokens)
        .with_realtime(realtime)
        .with_settings(config.stack_settings())
}
