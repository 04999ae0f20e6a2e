//! Executor running handlers inside the current process.
//!
//! Used directly by the in-process executor manager and, on the far side of
//! the framed transport, by the executor worker process.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{
    DependencyStates, DeployReport, DeployResult, DryRunReport, Executor, ExecutorError, ExecutorId,
    FactsReport, HandlerContext, HandlerError, HandlerRegistry, HandlerResourceState, LogLine,
    ResourceDetails,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PoolError;
use crate::executor_manager::{AgentExecutorManager, ManagedExecutor};
use crate::manager::CreateMember;
use crate::member::{InFlight, MemberLifecycle, PoolMember};

pub struct LocalExecutor {
    id: ExecutorId,
    registry: HandlerRegistry,
    lifecycle: MemberLifecycle,
    in_flight: AtomicUsize,
    open_versions: Mutex<BTreeSet<u64>>,
}

impl LocalExecutor {
    pub fn new(id: ExecutorId, registry: HandlerRegistry) -> Self {
        Self {
            id,
            registry,
            lifecycle: MemberLifecycle::new(),
            in_flight: AtomicUsize::new(0),
            open_versions: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> &ExecutorId {
        &self.id
    }

    pub async fn open_versions(&self) -> Vec<u64> {
        self.open_versions.lock().await.iter().copied().collect()
    }

    fn check_running(&self) -> Result<(), ExecutorError> {
        if self.lifecycle.running() {
            Ok(())
        } else {
            Err(ExecutorError::ShuttingDown)
        }
    }
}

fn report(
    resource: &ResourceDetails,
    action_id: Uuid,
    state: HandlerResourceState,
    ctx: HandlerContext,
    extra: Option<LogLine>,
) -> DeployReport {
    let (changes, mut messages) = ctx.into_parts();
    messages.extend(extra);
    DeployReport {
        resource_id: resource.id.clone(),
        action_id,
        state,
        changes,
        messages,
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        action_id: Uuid,
        resource: &ResourceDetails,
        reason: &str,
        requires: &DependencyStates,
    ) -> Result<DeployReport, ExecutorError> {
        self.check_running()?;
        let _in_flight = InFlight::enter(&self.in_flight);
        self.lifecycle.touch();
        debug!(executor = %self.id, resource = %resource.id, reason = %reason, "executing deploy");

        let bad: Vec<String> = requires
            .iter()
            .filter(|(_, result)| matches!(result, DeployResult::Failed | DeployResult::Skipped))
            .map(|(id, result)| format!("{id} ({result})"))
            .collect();
        if !bad.is_empty() {
            return Ok(report(
                resource,
                action_id,
                HandlerResourceState::SkippedForDependency,
                HandlerContext::new(),
                Some(LogLine::info(format!(
                    "skipping {} because of failed dependencies: {}",
                    resource.id,
                    bad.join(", ")
                ))),
            ));
        }

        let Some(handler) = self.registry.handler_for(&resource.id) else {
            return Ok(report(
                resource,
                action_id,
                HandlerResourceState::Unavailable,
                HandlerContext::new(),
                Some(LogLine::error(format!(
                    "no handler available for entity type {}",
                    resource.id.entity_type()
                ))),
            ));
        };

        // handlers run on their own task so a panic fails the deploy, not the executor
        let details = resource.clone();
        let outcome = tokio::spawn(async move {
            let mut ctx = HandlerContext::new();
            let result = handler.deploy(&mut ctx, &details).await;
            (ctx, result)
        })
        .await;

        let deploy_report = match outcome {
            Ok((ctx, Ok(()))) => report(resource, action_id, HandlerResourceState::Deployed, ctx, None),
            Ok((ctx, Err(HandlerError::Skip(msg)))) => report(
                resource,
                action_id,
                HandlerResourceState::Skipped,
                ctx,
                Some(LogLine::info(msg)),
            ),
            Ok((ctx, Err(HandlerError::SkipForDependency(msg)))) => report(
                resource,
                action_id,
                HandlerResourceState::SkippedForDependency,
                ctx,
                Some(LogLine::info(msg)),
            ),
            Ok((ctx, Err(HandlerError::Failed(msg)))) => report(
                resource,
                action_id,
                HandlerResourceState::Failed,
                ctx,
                Some(LogLine::error(msg)),
            ),
            Err(join) => {
                warn!(executor = %self.id, resource = %resource.id, error = %join, "handler panicked");
                DeployReport::failed(resource.id.clone(), action_id, format!("handler panicked: {join}"))
            }
        };
        Ok(deploy_report)
    }

    async fn dry_run(
        &self,
        resources: &[ResourceDetails],
        dry_run_id: Uuid,
    ) -> Result<Vec<DryRunReport>, ExecutorError> {
        self.check_running()?;
        let _in_flight = InFlight::enter(&self.in_flight);
        self.lifecycle.touch();

        let mut reports = Vec::with_capacity(resources.len());
        for resource in resources {
            let mut ctx = HandlerContext::new();
            let result = match self.registry.handler_for(&resource.id) {
                Some(handler) => handler.dry_run(&mut ctx, resource).await,
                None => Err(HandlerError::Failed(format!(
                    "no handler available for entity type {}",
                    resource.id.entity_type()
                ))),
            };
            let (changes, mut messages) = ctx.into_parts();
            let failed = match result {
                Ok(()) => false,
                Err(e) => {
                    messages.push(LogLine::error(e.to_string()));
                    true
                }
            };
            reports.push(DryRunReport {
                resource_id: resource.id.clone(),
                dry_run_id,
                model_version: resource.model_version,
                changes,
                messages,
                failed,
            });
        }
        Ok(reports)
    }

    async fn get_facts(&self, resource: &ResourceDetails) -> Result<FactsReport, ExecutorError> {
        self.check_running()?;
        let _in_flight = InFlight::enter(&self.in_flight);
        self.lifecycle.touch();

        let Some(handler) = self.registry.handler_for(&resource.id) else {
            return Ok(FactsReport {
                resource_id: resource.id.clone(),
                facts: Default::default(),
                messages: vec![LogLine::error("no handler available")],
                success: false,
            });
        };
        Ok(match handler.facts(resource).await {
            Ok(facts) => FactsReport {
                resource_id: resource.id.clone(),
                facts,
                messages: Vec::new(),
                success: true,
            },
            Err(e) => FactsReport {
                resource_id: resource.id.clone(),
                facts: Default::default(),
                messages: vec![LogLine::error(e.to_string())],
                success: false,
            },
        })
    }

    async fn open_version(&self, version: u64) -> Result<(), ExecutorError> {
        self.open_versions.lock().await.insert(version);
        Ok(())
    }

    async fn close_version(&self, version: u64) -> Result<(), ExecutorError> {
        self.open_versions.lock().await.remove(&version);
        Ok(())
    }
}

#[async_trait]
impl PoolMember for LocalExecutor {
    fn name(&self) -> String {
        format!("local executor {}", self.id)
    }

    fn lifecycle(&self) -> &MemberLifecycle {
        &self.lifecycle
    }

    fn can_be_cleaned_up(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    async fn request_shutdown(&self) {
        if self.lifecycle.mark_shutting_down() {
            debug!(executor = %self.id, "stopping local executor");
        }
        self.lifecycle.mark_shut_down();
    }
}

impl ManagedExecutor for LocalExecutor {
    fn executor_id(&self) -> &ExecutorId {
        &self.id
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Builds in-process executors sharing one handler registry.
pub struct LocalExecutorFactory {
    registry: HandlerRegistry,
}

impl LocalExecutorFactory {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CreateMember<ExecutorId, LocalExecutor> for LocalExecutorFactory {
    async fn create_member(&self, key: &ExecutorId) -> Result<Arc<LocalExecutor>, PoolError> {
        debug!(executor = %key, "creating local executor");
        Ok(Arc::new(LocalExecutor::new(key.clone(), self.registry.clone())))
    }
}

/// Executor manager running deploy code inside this process.
pub type LocalExecutorManager = AgentExecutorManager<LocalExecutor>;

impl AgentExecutorManager<LocalExecutor> {
    pub fn in_process(registry: HandlerRegistry, cap: usize, retention: Duration) -> Self {
        Self::new("local-executors", Arc::new(LocalExecutorFactory::new(registry)), cap, retention)
    }
}
