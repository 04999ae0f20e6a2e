//! Pool member contract and the lifecycle bookkeeping every member embeds.
//!
//! Shutdown is two-phase: the owner calls [`PoolMember::request_shutdown`],
//! the member drains and then confirms through
//! [`MemberLifecycle::mark_shut_down`]. Pool managers only drop a member once
//! that confirmation arrives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug)]
pub struct MemberLifecycle {
    last_used: Mutex<Instant>,
    shutting_down: AtomicBool,
    shut_down: watch::Sender<bool>,
}

impl Default for MemberLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberLifecycle {
    pub fn new() -> Self {
        let (shut_down, _) = watch::channel(false);
        Self {
            last_used: Mutex::new(Instant::now()),
            shutting_down: AtomicBool::new(false),
            shut_down,
        }
    }

    /// Record a use, resetting the idle clock.
    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    /// Flag the member as draining. Returns `true` only for the first caller,
    /// so the shutdown sequence runs once.
    pub fn mark_shutting_down(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Confirm the member is fully stopped and wake every waiter.
    pub fn mark_shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shut_down.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.borrow()
    }

    pub fn running(&self) -> bool {
        !self.is_shutting_down() && !self.is_shut_down()
    }

    pub async fn wait_shut_down(&self) {
        let mut rx = self.shut_down.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Wait at most `timeout` for the shutdown confirmation.
    pub async fn wait_shut_down_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_shut_down()).await.is_ok()
    }
}

/// Counts a call as in flight until dropped, however the call ends.
pub(crate) struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Something a [`PoolManager`](crate::PoolManager) caches and eventually tears down.
#[async_trait]
pub trait PoolMember: Send + Sync + 'static {
    /// Human readable name for log lines.
    fn name(&self) -> String;

    fn lifecycle(&self) -> &MemberLifecycle;

    fn running(&self) -> bool {
        self.lifecycle().running()
    }

    /// Whether idle eviction may pick this member right now.
    fn can_be_cleaned_up(&self) -> bool {
        true
    }

    fn last_used(&self) -> Instant {
        self.lifecycle().last_used()
    }

    /// Start draining. Implementations must eventually call
    /// [`MemberLifecycle::mark_shut_down`].
    async fn request_shutdown(&self);

    async fn join(&self, timeout: Duration) -> bool {
        self.lifecycle().wait_shut_down_for(timeout).await
    }
}
