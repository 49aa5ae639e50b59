//! Lease-guarded execution of document mutations.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::stack::{Lease, LockService};

/// Lease timing and acquisition policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub ttl: Duration,
    /// Extra attempts after the first one fails.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to `retry_delay`.
    pub retry_jitter: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(10_000),
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(200),
        }
    }
}

/// Resource key of a tenant-scoped lock.
pub fn lock_key(tenant_id: &str, resource: &str) -> String {
    format!("{}:locks:{}", tenant_id, resource)
}

/// A held lease with its renewal ticker.
///
/// Dropping the guard without [`LockGuard::release`] stops renewal and
/// releases the lease in the background.
pub struct LockGuard {
    locks: Arc<dyn LockService>,
    lease: Option<Lease>,
    renewal: JoinHandle<()>,
}

impl LockGuard {
    /// Acquire `key` with bounded retry, then start renewing at half the TTL.
    pub async fn acquire(
        locks: Arc<dyn LockService>,
        key: String,
        settings: &LockSettings,
    ) -> Result<Self, TaskError> {
        let mut attempt = 0;
        let lease = loop {
            if let Some(lease) = locks.try_acquire(&key, settings.ttl).await? {
                break lease;
            }
            if attempt >= settings.retry_count {
                return Err(TaskError::Lock(format!(
                    "could not acquire lock on {} after {} attempts",
                    key,
                    attempt + 1
                )));
            }
            attempt += 1;
            let jitter_ms = settings.retry_jitter.as_millis() as u64;
            let jitter = if jitter_ms > 0 {
                Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
            } else {
                Duration::ZERO
            };
            debug!(%key, attempt, "Lock busy, retrying");
            tokio::time::sleep(settings.retry_delay + jitter).await;
        };

        let renewal = spawn_renewal(locks.clone(), lease.clone(), settings.ttl);
        debug!(key = %lease.key, "Lock acquired");

        Ok(Self {
            locks,
            lease: Some(lease),
            renewal,
        })
    }

    /// Stop renewal and release the lease. Release failures are logged.
    pub async fn release(mut self) {
        self.renewal.abort();
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.locks.release(&lease).await {
                warn!(key = %lease.key, error = %e, "Failed to release lock");
            } else {
                debug!(key = %lease.key, "Lock released");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        if let Some(lease) = self.lease.take() {
            let locks = self.locks.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = locks.release(&lease).await {
                        warn!(key = %lease.key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
        }
    }
}

fn spawn_renewal(locks: Arc<dyn LockService>, lease: Lease, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (ttl / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            if let Err(e) = locks.extend(&lease, ttl).await {
                warn!(key = %lease.key, error = %e, "Failed to extend lock");
            }
        }
    })
}

/// Run `body` while holding the lease on `key`.
///
/// The lease is released on every exit path; `body`'s error is returned
/// unchanged.
pub async fn with_lock<T, F>(
    locks: &Arc<dyn LockService>,
    settings: &LockSettings,
    key: String,
    body: F,
) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, TaskError>>,
{
    let guard = LockGuard::acquire(locks.clone(), key, settings).await?;
    let result = body.await;
    guard.release().await;
    result
}
