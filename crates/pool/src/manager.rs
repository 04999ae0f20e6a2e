//! Generic cache-with-lifecycle.
//!
//! A [`PoolManager`] maps keys to live members. `get` hands out a running
//! member or creates one through the pool's [`CreateMember`] factory;
//! creation is single-flighted per key. A watcher task per member waits for
//! its shutdown confirmation and then drops it from the cache.
//!
//! Pools stack: a member may itself own an inner `PoolManager` and request
//! its own shutdown once that inner pool runs empty (see
//! [`CreateMember::member_removed`]).

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::PoolError;
use crate::member::PoolMember;

/// Factory and event hooks of one pool.
#[async_trait]
pub trait CreateMember<K, M>: Send + Sync + 'static {
    async fn create_member(&self, key: &K) -> Result<Arc<M>, PoolError>;

    /// Runs right before a new member for `key` is created, with every
    /// member currently cached. Used to make room under a cap.
    async fn pre_create(&self, _key: &K, _members: &[Arc<M>]) {}

    /// Runs once a member is dropped from the pool; `remaining` counts the
    /// members left.
    async fn member_removed(&self, _member: &Arc<M>, _remaining: usize) {}

    /// Runs after the pool asked every member to shut down.
    async fn shutdown(&self) {}
}

pub struct PoolManager<K, M> {
    name: String,
    factory: Arc<dyn CreateMember<K, M>>,
    members: Mutex<HashMap<K, Arc<M>>>,
    creating: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
    closing: AtomicBool,
}

impl<K, M> PoolManager<K, M>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: PoolMember,
{
    pub fn new(name: impl Into<String>, factory: Arc<dyn CreateMember<K, M>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            factory,
            members: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the running member for `key`, creating it if needed.
    pub async fn get(self: &Arc<Self>, key: &K) -> Result<Arc<M>, PoolError> {
        if let Some(member) = self.get_running(key) {
            member.lifecycle().touch();
            return Ok(member);
        }
        self.ensure_open()?;

        let slot = {
            let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
            creating.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock().await;
        let created = self.create_locked(key).await;
        drop(guard);
        self.release_slot(key, &slot);
        created
    }

    async fn create_locked(self: &Arc<Self>, key: &K) -> Result<Arc<M>, PoolError> {
        // whoever held the slot before us may have created it already
        if let Some(member) = self.get_running(key) {
            member.lifecycle().touch();
            return Ok(member);
        }
        self.ensure_open()?;

        let others = self.members();
        self.factory.pre_create(key, &others).await;

        let member = self.factory.create_member(key).await?;
        member.lifecycle().touch();
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), member.clone());
        debug!(pool = %self.name, member = %member.name(), "pool member created");
        self.watch(key.clone(), member.clone());
        Ok(member)
    }

    /// Forget the creation slot of `key` once no other caller waits on it.
    fn release_slot(&self, key: &K, slot: &Arc<tokio::sync::Mutex<()>>) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = creating
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if idle {
            creating.remove(key);
        }
    }

    /// Keys with a creation in progress or queued.
    pub fn pending_creations(&self) -> usize {
        self.creating.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown(self.name.clone()));
        }
        Ok(())
    }

    fn watch(self: &Arc<Self>, key: K, member: Arc<M>) {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            member.lifecycle().wait_shut_down().await;
            if let Some(pool) = pool.upgrade() {
                pool.notify_member_shutdown(&key, &member).await;
            }
        });
    }

    /// Drop `member` from the cache, unless a newer member took its key.
    pub async fn notify_member_shutdown(&self, key: &K, member: &Arc<M>) -> bool {
        let remaining = {
            let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
            match members.get(key) {
                Some(current) if Arc::ptr_eq(current, member) => {
                    members.remove(key);
                }
                _ => return false,
            }
            members.len()
        };
        debug!(pool = %self.name, member = %member.name(), remaining, "pool member removed");
        self.factory.member_removed(member, remaining).await;
        true
    }

    fn get_running(&self, key: &K) -> Option<Arc<M>> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|m| m.running())
            .cloned()
    }

    /// The cached member for `key`, without creating or touching it.
    pub fn peek(&self, key: &K) -> Option<Arc<M>> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn members(&self) -> Vec<Arc<M>> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<(K, Arc<M>)> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Refuse new members and ask every cached member to shut down.
    pub async fn request_shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let members = self.members();
        info!(pool = %self.name, members = members.len(), "shutting down pool");
        for member in &members {
            member.request_shutdown().await;
        }
        self.factory.shutdown().await;
    }

    /// Wait until every member confirmed shutdown; `false` on timeout.
    pub async fn join(&self, timeout: Duration) -> bool {
        let members = self.members();
        let all = futures::future::join_all(members.iter().map(|m| m.join(timeout)));
        all.await.into_iter().all(|done| done)
    }
}
