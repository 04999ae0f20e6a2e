//! Integration tests for the generic pool managers.
//!
//! Members here are plain mocks; what is under test is creation,
//! single-flighting, shutdown bookkeeping, idle eviction and stacking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use converge_pool::{CreateMember, MemberLifecycle, PoolError, PoolManager, PoolMember, TimeBasedPoolManager};

// ── Mocks ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Mock {
    key: String,
    lifecycle: MemberLifecycle,
    cleanable: bool,
}

#[async_trait]
impl PoolMember for Mock {
    fn name(&self) -> String {
        format!("mock {}", self.key)
    }

    fn lifecycle(&self) -> &MemberLifecycle {
        &self.lifecycle
    }

    fn can_be_cleaned_up(&self) -> bool {
        self.cleanable
    }

    async fn request_shutdown(&self) {
        self.lifecycle.mark_shutting_down();
        self.lifecycle.mark_shut_down();
    }
}

#[derive(Default)]
struct MockFactory {
    created: AtomicUsize,
    delay: Duration,
    pinned: Vec<String>,
    removed: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl CreateMember<String, Mock> for MockFactory {
    async fn create_member(&self, key: &String) -> Result<Arc<Mock>, PoolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if key == "broken" {
            return Err(PoolError::Create {
                key: key.clone(),
                message: "cannot build".into(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Mock {
            key: key.clone(),
            lifecycle: MemberLifecycle::new(),
            cleanable: !self.pinned.contains(key),
        }))
    }

    async fn member_removed(&self, member: &Arc<Mock>, remaining: usize) {
        self.removed.lock().unwrap().push((member.key.clone(), remaining));
    }
}

fn mock_pool(name: &str, factory: Arc<MockFactory>) -> Arc<PoolManager<String, Mock>> {
    PoolManager::new(name, factory)
}

fn timed_pool(name: &str, factory: Arc<MockFactory>, retention: Duration) -> TimeBasedPoolManager<String, Mock> {
    TimeBasedPoolManager::new(name, factory, retention)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

// ── Plain pool ───────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_gets_create_one_member() {
    let factory = Arc::new(MockFactory {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let pool = mock_pool("single-flight", factory.clone());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&"a".to_string()).await.unwrap() })
        })
        .collect();
    let members: Vec<Arc<Mock>> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert!(members.iter().all(|m| Arc::ptr_eq(m, &members[0])));
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.pending_creations(), 0);
}

#[tokio::test]
async fn shut_down_member_is_dropped_and_recreated() {
    let factory = Arc::new(MockFactory::default());
    let pool = mock_pool("recreate", factory.clone());
    let key = "a".to_string();

    let first = pool.get(&key).await.unwrap();
    first.request_shutdown().await;
    eventually("member removed", || pool.is_empty()).await;
    assert_eq!(factory.removed.lock().unwrap().as_slice(), &[("a".to_string(), 0)]);

    let second = pool.get(&key).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_shutdown_does_not_remove_replacement() {
    let factory = Arc::new(MockFactory::default());
    let pool = mock_pool("stale", factory.clone());
    let key = "a".to_string();

    let first = pool.get(&key).await.unwrap();
    first.lifecycle().mark_shutting_down();
    // no longer running, so the pool builds a replacement under the same key
    let second = pool.get(&key).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    assert!(!pool.notify_member_shutdown(&key, &first).await);
    assert!(Arc::ptr_eq(&pool.peek(&key).unwrap(), &second));
}

#[tokio::test]
async fn creation_errors_propagate_and_cache_nothing() {
    let pool = mock_pool("errors", Arc::new(MockFactory::default()));
    let err = pool.get(&"broken".to_string()).await.unwrap_err();
    assert!(matches!(err, PoolError::Create { .. }));
    assert!(pool.is_empty());
    assert_eq!(pool.pending_creations(), 0);
}

#[tokio::test]
async fn creation_slots_do_not_accumulate() {
    let pool = mock_pool("slots", Arc::new(MockFactory::default()));
    for n in 0..20 {
        pool.get(&format!("key{n}")).await.unwrap();
    }
    assert_eq!(pool.len(), 20);
    assert_eq!(pool.pending_creations(), 0);
}

#[tokio::test]
async fn closed_pool_refuses_new_members() {
    let pool = mock_pool("closing", Arc::new(MockFactory::default()));
    let member = pool.get(&"a".to_string()).await.unwrap();

    pool.request_shutdown().await;
    assert!(member.lifecycle().is_shut_down());
    assert!(pool.join(Duration::from_secs(1)).await);
    assert!(matches!(
        pool.get(&"b".to_string()).await,
        Err(PoolError::ShuttingDown(_))
    ));
}

// ── Idle eviction ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_member_is_evicted_after_retention() {
    let pool = timed_pool("idle", Arc::new(MockFactory::default()), Duration::from_secs(60));
    let member = pool.get(&"a".to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(member.running());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(member.lifecycle().is_shut_down());
    eventually("evicted member removed", || pool.pool().is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn use_resets_idle_clock() {
    let pool = timed_pool("touch", Arc::new(MockFactory::default()), Duration::from_secs(60));
    let key = "a".to_string();
    let member = pool.get(&key).await.unwrap();

    tokio::time::sleep(Duration::from_secs(40)).await;
    let same = pool.get(&key).await.unwrap();
    assert!(Arc::ptr_eq(&member, &same));

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(member.running(), "used 21s ago, retention is 60s");

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(member.lifecycle().is_shut_down());
}

#[tokio::test(start_paused = true)]
async fn members_that_refuse_cleanup_stay() {
    let factory = Arc::new(MockFactory {
        pinned: vec!["busy".to_string()],
        ..Default::default()
    });
    let pool = timed_pool("pinned", factory, Duration::from_secs(10));
    let busy = pool.get(&"busy".to_string()).await.unwrap();
    let idle = pool.get(&"idle".to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(busy.running());
    assert!(idle.lifecycle().is_shut_down());
}

// ── Stacking ─────────────────────────────────────────────────────────

/// A member that owns an inner pool and stops itself when it runs empty.
struct Group {
    key: String,
    lifecycle: MemberLifecycle,
    inner: Arc<PoolManager<String, Mock>>,
}

#[async_trait]
impl PoolMember for Group {
    fn name(&self) -> String {
        format!("group {}", self.key)
    }

    fn lifecycle(&self) -> &MemberLifecycle {
        &self.lifecycle
    }

    async fn request_shutdown(&self) {
        if self.lifecycle.mark_shutting_down() {
            self.inner.request_shutdown().await;
        }
        self.lifecycle.mark_shut_down();
    }
}

struct LeafFactory {
    group: Weak<Group>,
    leaves: MockFactory,
}

#[async_trait]
impl CreateMember<String, Mock> for LeafFactory {
    async fn create_member(&self, key: &String) -> Result<Arc<Mock>, PoolError> {
        self.leaves.create_member(key).await
    }

    async fn member_removed(&self, _member: &Arc<Mock>, remaining: usize) {
        if remaining == 0 {
            if let Some(group) = self.group.upgrade() {
                tokio::spawn(async move { group.request_shutdown().await });
            }
        }
    }
}

struct GroupFactory;

#[async_trait]
impl CreateMember<String, Group> for GroupFactory {
    async fn create_member(&self, key: &String) -> Result<Arc<Group>, PoolError> {
        Ok(Arc::new_cyclic(|weak: &Weak<Group>| Group {
            key: key.clone(),
            lifecycle: MemberLifecycle::new(),
            inner: PoolManager::new(
                format!("{key} leaves"),
                Arc::new(LeafFactory {
                    group: weak.clone(),
                    leaves: MockFactory::default(),
                }),
            ),
        }))
    }
}

#[tokio::test]
async fn emptied_inner_pool_shuts_outer_member_down() {
    let outer: Arc<PoolManager<String, Group>> = PoolManager::new("groups", Arc::new(GroupFactory));
    let group = outer.get(&"g".to_string()).await.unwrap();
    let leaf1 = group.inner.get(&"l1".to_string()).await.unwrap();
    let leaf2 = group.inner.get(&"l2".to_string()).await.unwrap();

    leaf1.request_shutdown().await;
    eventually("first leaf removed", || group.inner.len() == 1).await;
    assert!(group.running());

    leaf2.request_shutdown().await;
    eventually("group stopped", || group.lifecycle().is_shut_down()).await;
    eventually("group removed from outer pool", || outer.is_empty()).await;
}

#[tokio::test]
async fn stopping_outer_member_stops_inner_members() {
    let outer: Arc<PoolManager<String, Group>> = PoolManager::new("groups", Arc::new(GroupFactory));
    let group = outer.get(&"g".to_string()).await.unwrap();
    let leaf = group.inner.get(&"l1".to_string()).await.unwrap();

    outer.request_shutdown().await;
    assert!(leaf.lifecycle().is_shut_down());
    assert!(group.lifecycle().is_shut_down());
}
