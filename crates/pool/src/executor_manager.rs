//! Top-level executor pool handed to the scheduler.
//!
//! Executors are keyed by [`ExecutorId`] (agent plus code blueprint), evicted
//! after `executor_retention_time` of idleness, and capped per agent: asking
//! for one more executor than the cap allows first stops one of the agent's
//! existing executors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{Executor, ExecutorBlueprint, ExecutorError, ExecutorId, ExecutorManager, ModuleInstallSpec};
use tracing::{info, warn};

use crate::error::PoolError;
use crate::manager::CreateMember;
use crate::member::PoolMember;
use crate::time_based::TimeBasedPoolManager;

/// How long cap eviction waits for the evicted executor to confirm shutdown.
const EVICTION_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// An executor that can live in an [`AgentExecutorManager`].
pub trait ManagedExecutor: Executor + PoolMember {
    fn executor_id(&self) -> &ExecutorId;

    /// Calls currently running on this executor.
    fn in_flight(&self) -> usize;
}

/// Pick the executor to stop when `agent` is at its cap.
///
/// The least recently used idle executor goes first; when every executor is
/// busy, the least recently used one overall.
pub fn eviction_candidate<E: ManagedExecutor>(agent: &str, members: &[Arc<E>], cap: usize) -> Option<Arc<E>> {
    let mut own: Vec<&Arc<E>> = members
        .iter()
        .filter(|m| m.running() && m.executor_id().agent_name == agent)
        .collect();
    if own.len() < cap {
        return None;
    }
    own.sort_by_key(|m| m.last_used());
    own.iter()
        .find(|m| m.in_flight() == 0)
        .or_else(|| own.first())
        .map(|m| Arc::clone(m))
}

/// Wraps the real factory with per-agent cap enforcement.
struct CappedFactory<E> {
    inner: Arc<dyn CreateMember<ExecutorId, E>>,
    cap: usize,
}

#[async_trait]
impl<E: ManagedExecutor> CreateMember<ExecutorId, E> for CappedFactory<E> {
    async fn create_member(&self, key: &ExecutorId) -> Result<Arc<E>, PoolError> {
        self.inner.create_member(key).await
    }

    async fn pre_create(&self, key: &ExecutorId, members: &[Arc<E>]) {
        if let Some(victim) = eviction_candidate(&key.agent_name, members, self.cap) {
            info!(
                agent = %key.agent_name,
                cap = self.cap,
                executor = %victim.executor_id(),
                "executor cap reached, stopping oldest executor"
            );
            victim.request_shutdown().await;
            if !victim.join(EVICTION_JOIN_TIMEOUT).await {
                warn!(executor = %victim.executor_id(), "evicted executor did not confirm shutdown in time");
            }
        }
        self.inner.pre_create(key, members).await;
    }

    async fn member_removed(&self, member: &Arc<E>, remaining: usize) {
        self.inner.member_removed(member, remaining).await;
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

pub struct AgentExecutorManager<E> {
    pool: TimeBasedPoolManager<ExecutorId, E>,
    cap: usize,
}

impl<E: ManagedExecutor> AgentExecutorManager<E> {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn CreateMember<ExecutorId, E>>,
        cap: usize,
        retention: Duration,
    ) -> Self {
        let cap = cap.max(1);
        let capped: Arc<dyn CreateMember<ExecutorId, E>> = Arc::new(CappedFactory { inner: factory, cap });
        Self {
            pool: TimeBasedPoolManager::new(name, capped, retention),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Running executors of one agent.
    pub fn executors_for_agent(&self, agent_name: &str) -> Vec<Arc<E>> {
        self.pool
            .pool()
            .members()
            .into_iter()
            .filter(|e| e.running() && e.executor_id().agent_name == agent_name)
            .collect()
    }

    pub fn executors(&self) -> Vec<Arc<E>> {
        self.pool.pool().members()
    }

    pub async fn get(&self, id: &ExecutorId) -> Result<Arc<E>, ExecutorError> {
        Ok(self.pool.get(id).await?)
    }

    pub async fn join(&self, timeout: Duration) -> bool {
        self.pool.join(timeout).await
    }
}

#[async_trait]
impl<E: ManagedExecutor> ExecutorManager for AgentExecutorManager<E> {
    async fn get_executor(
        &self,
        agent_name: &str,
        agent_uri: &str,
        code: &[ModuleInstallSpec],
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let blueprint = ExecutorBlueprint::from_specs(code)?;
        let id = ExecutorId::new(agent_name, agent_uri, blueprint);
        let executor: Arc<dyn Executor> = self.get(&id).await?;
        Ok(executor)
    }

    async fn stop_for_agent(&self, agent_name: &str) -> Vec<ExecutorId> {
        let executors = self.executors_for_agent(agent_name);
        for executor in &executors {
            executor.request_shutdown().await;
        }
        if !executors.is_empty() {
            info!(agent = %agent_name, stopped = executors.len(), "stopped executors for agent");
        }
        executors.iter().map(|e| e.executor_id().clone()).collect()
    }

    async fn stop_all(&self) {
        self.pool.request_shutdown().await;
    }
}
