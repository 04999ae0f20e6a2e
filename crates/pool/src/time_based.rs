//! Pool variant that shuts down members left idle for too long.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::PoolError;
use crate::manager::{CreateMember, PoolManager};
use crate::member::PoolMember;

/// Shortest pause between two cleanup passes.
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(500);

pub struct TimeBasedPoolManager<K, M> {
    pool: Arc<PoolManager<K, M>>,
    retention: Duration,
    stop: Arc<Notify>,
}

impl<K, M> TimeBasedPoolManager<K, M>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: PoolMember,
{
    /// Create the pool and start its cleanup loop.
    pub fn new(name: impl Into<String>, factory: Arc<dyn CreateMember<K, M>>, retention: Duration) -> Self {
        let pool = PoolManager::new(name, factory);
        let stop = Arc::new(Notify::new());
        tokio::spawn(Self::cleanup_loop(Arc::downgrade(&pool), retention, stop.clone()));
        Self { pool, retention, stop }
    }

    pub fn pool(&self) -> &Arc<PoolManager<K, M>> {
        &self.pool
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn get(&self, key: &K) -> Result<Arc<M>, PoolError> {
        self.pool.get(key).await
    }

    async fn cleanup_loop(pool: std::sync::Weak<PoolManager<K, M>>, retention: Duration, stop: Arc<Notify>) {
        loop {
            let next = match pool.upgrade() {
                Some(pool) => cleanup_idle(&pool, retention).await,
                None => break,
            };
            tokio::select! {
                _ = tokio::time::sleep(next.max(MIN_CLEANUP_INTERVAL)) => {}
                _ = stop.notified() => break,
            }
        }
        debug!("pool cleanup loop stopped");
    }

    /// Stop evicting idle members; the members themselves stay up.
    pub fn stop_cleanup(&self) {
        self.stop.notify_one();
    }

    /// Stop the cleanup loop, then shut every member down.
    pub async fn request_shutdown(&self) {
        self.stop_cleanup();
        self.pool.request_shutdown().await;
    }

    pub async fn join(&self, timeout: Duration) -> bool {
        self.pool.join(timeout).await
    }
}

/// Request shutdown of every member idle for at least `retention`.
///
/// Returns how long until the next member could expire.
pub async fn cleanup_idle<K, M>(pool: &PoolManager<K, M>, retention: Duration) -> Duration
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: PoolMember,
{
    let now = Instant::now();
    let mut next = retention;
    for member in pool.members() {
        if !member.running() {
            continue;
        }
        let idle = now.saturating_duration_since(member.last_used());
        if idle >= retention && member.can_be_cleaned_up() {
            info!(pool = %pool.name(), member = %member.name(), idle_secs = idle.as_secs(), "stopping idle pool member");
            member.request_shutdown().await;
        } else if idle < retention {
            next = next.min(retention - idle);
        }
    }
    next
}

impl<K, M> Drop for TimeBasedPoolManager<K, M> {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}
