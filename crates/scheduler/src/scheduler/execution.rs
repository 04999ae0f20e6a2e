//! Running one queued task on an executor and folding the outcome back into
//! the model.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use converge_core::{
    DeployReport, DeployResult, DryRunReport, Executor, ExecutorBlueprint, ExecutorError, ExecutorManager,
    FactsReport, HandlerResourceState, LogLine, ResourceId,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{ResourceScheduler, AGENT_URI};
use crate::error::SchedulerError;
use crate::persistence::{PersistedResourceState, ResourceAction};
use crate::state::Blocked;
use crate::task::{DeployReason, QueuedTask};

impl ResourceScheduler {
    /// Executor for `agent` with the code of `version` installed, with the
    /// version opened on it.
    async fn executor_for(&self, agent: &str, version: u64) -> Result<Arc<dyn Executor>, SchedulerError> {
        let shared = &self.shared;
        let code = shared.code.get_install_spec(shared.environment, version, agent).await?;
        let executor = timeout(
            shared.rpc_timeout,
            shared.executors.get_executor(agent, AGENT_URI, &code),
        )
        .await
        .map_err(|_| ExecutorError::Timeout(shared.rpc_timeout))??;

        let key = format!("{agent}/{}", ExecutorBlueprint::from_specs(&code)?.blueprint_hash());
        let previous = {
            let mut opened = shared.opened_versions.lock().unwrap_or_else(PoisonError::into_inner);
            match opened.insert(key, version) {
                Some(previous) if previous == version => return Ok(executor),
                previous => previous,
            }
        };
        if let Some(previous) = previous {
            if let Err(e) = executor.close_version(previous).await {
                warn!(agent = %agent, version = previous, error = %e, "could not close version");
            }
        }
        if let Err(e) = executor.open_version(version).await {
            warn!(agent = %agent, version, error = %e, "could not open version");
        }
        Ok(executor)
    }

    /// Deploy one resource and record the outcome.
    pub(crate) async fn perform_deploy(&self, agent: &str, item: QueuedTask, resource: ResourceId) {
        let prepared = {
            let state = self.shared.state.lock().await;
            match (state.model.details(&resource), state.model.state(&resource)) {
                (Some(details), Some(rs)) if rs.blocked != Blocked::Blocked => Some((
                    details.deep_copy(),
                    rs.intent_hash.clone(),
                    state.model.dependency_results(&resource),
                    state.model.version,
                )),
                _ => None,
            }
        };
        let Some((details, intent_hash, requires, version)) = prepared else {
            debug!(resource = %resource, "resource no longer deployable, dropping task");
            let mut state = self.shared.state.lock().await;
            self.shared.queues.task_done(agent, &item.task);
            state.work.finished_deploy(&resource, &self.shared.queues);
            return;
        };

        let action_id = Uuid::new_v4();
        let started = Utc::now();
        let reason = item.reason.to_string();
        debug!(agent = %agent, resource = %resource, reason = %reason, "deploying");
        let report = match self.executor_for(agent, version).await {
            Ok(executor) => {
                match timeout(
                    self.shared.rpc_timeout,
                    executor.execute(action_id, &details, &reason, &requires),
                )
                .await
                {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => DeployReport::failed(resource.clone(), action_id, format!("deploy failed: {e}")),
                    Err(_) => {
                        let e = ExecutorError::Timeout(self.shared.rpc_timeout);
                        warn!(agent = %agent, resource = %resource, "deploy timed out, recycling executors");
                        let stopped = self.shared.executors.stop_for_agent(agent).await;
                        debug!(agent = %agent, stopped = stopped.len(), "executors stopped after timeout");
                        DeployReport::failed(resource.clone(), action_id, format!("deploy failed: {e}"))
                    }
                }
            }
            Err(e) => {
                warn!(agent = %agent, resource = %resource, error = %e, "no executor available");
                DeployReport::failed(resource.clone(), action_id, format!("could not obtain an executor: {e}"))
            }
        };

        self.deploy_done(agent, &item, &resource, &intent_hash, version, started, report)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy_done(
        &self,
        agent: &str,
        item: &QueuedTask,
        resource: &ResourceId,
        intent_hash: &str,
        version: u64,
        started: DateTime<Utc>,
        report: DeployReport,
    ) {
        let finished = Utc::now();
        let result = report.result();
        let queues = &self.shared.queues;
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        queues.task_done(agent, &item.task);

        let current = state.model.contains(resource)
            && state
                .model
                .state(resource)
                .map(|rs| rs.intent_hash == intent_hash)
                .unwrap_or(false);
        let dependencies_good = state
            .model
            .dependency_results(resource)
            .values()
            .all(|r| r.is_good());

        let Some(rs) = state.model.states.get_mut(resource) else {
            state.work.finished_deploy(resource, queues);
            return;
        };
        let previous = rs.last_deploy_result;
        rs.last_deploy_result = result;
        rs.last_deployed = Some(finished);
        if current {
            rs.deployed_hash = Some(intent_hash.to_string());
            match report.state {
                HandlerResourceState::Deployed => {
                    state.model.dirty.remove(resource);
                }
                HandlerResourceState::SkippedForDependency if !dependencies_good => {
                    rs.blocked = Blocked::TemporarilyBlocked;
                    state.model.dirty.remove(resource);
                }
                _ => {}
            }
        } else {
            debug!(resource = %resource, "deploy finished for an outdated intent");
        }
        let snapshot = PersistedResourceState::from(&*rs);
        state.timers.update_timer(resource, rs);

        let mut persist = vec![(resource.clone(), snapshot)];
        if result == DeployResult::Deployed && matches!(previous, DeployResult::Failed | DeployResult::Skipped) {
            let recovered: Vec<ResourceId> = state.model.provides_of(resource).cloned().collect();
            let mut ready = HashSet::new();
            for dependent in recovered {
                if let Some(ds) = state.model.states.get_mut(&dependent) {
                    if ds.blocked == Blocked::TemporarilyBlocked {
                        ds.blocked = Blocked::NotBlocked;
                        persist.push((dependent.clone(), PersistedResourceState::from(&*ds)));
                        ready.insert(dependent);
                    }
                }
            }
            if !ready.is_empty() {
                for id in &ready {
                    state.model.mark_dirty(id);
                }
                info!(resource = %resource, dependents = ready.len(), "dependency recovered, rescheduling dependents");
                state.work.deploy_with_context(
                    &ready,
                    item.priority,
                    DeployReason::DependencyReady,
                    &state.model,
                    queues,
                );
            }
        }
        state.work.finished_deploy(resource, queues);

        let environment = self.shared.environment;
        for (id, snapshot) in &persist {
            if let Err(e) = self.shared.store.save(environment, id, snapshot).await {
                warn!(resource = %id, error = %e, "could not persist resource state");
            }
        }
        let action = ResourceAction {
            resource_id: resource.clone(),
            action_id: report.action_id,
            model_version: version,
            intent_hash: intent_hash.to_string(),
            reason: item.reason.to_string(),
            started,
            finished,
            state: report.state,
            result,
            changes: report.changes,
            messages: report.messages,
        };
        if let Err(e) = self.shared.store.record_action(environment, action).await {
            warn!(resource = %resource, error = %e, "could not record resource action");
        }
        drop(guard);
        info!(agent = %agent, resource = %resource, result = %result, "deploy finished");
    }

    /// Dry-run one resource of `version` and store the report.
    pub(crate) async fn perform_dry_run(&self, agent: &str, resource: &ResourceId, version: u64, dry_run_id: Uuid) {
        let details = {
            let state = self.shared.state.lock().await;
            if state.model.version == version {
                state.model.details(resource).map(|d| d.deep_copy())
            } else {
                None
            }
        };
        let failed = |message: String| DryRunReport {
            resource_id: resource.clone(),
            dry_run_id,
            model_version: version,
            changes: Default::default(),
            messages: vec![LogLine::error(message)],
            failed: true,
        };

        let reports = match details {
            None => vec![failed(format!("version {version} is no longer current"))],
            Some(details) => match self.executor_for(agent, version).await {
                Ok(executor) => match timeout(self.shared.rpc_timeout, executor.dry_run(&[details], dry_run_id)).await {
                    Ok(Ok(reports)) => reports,
                    Ok(Err(e)) => vec![failed(format!("dry-run failed: {e}"))],
                    Err(_) => vec![failed(format!(
                        "dry-run failed: {}",
                        ExecutorError::Timeout(self.shared.rpc_timeout)
                    ))],
                },
                Err(e) => vec![failed(format!("could not obtain an executor: {e}"))],
            },
        };
        if let Err(e) = self.shared.store.store_dry_run(self.shared.environment, reports).await {
            warn!(resource = %resource, error = %e, "could not store dry-run report");
        }
    }

    /// Collect facts of one resource and store them.
    pub(crate) async fn perform_facts(&self, agent: &str, resource: &ResourceId) {
        let prepared = {
            let state = self.shared.state.lock().await;
            state
                .model
                .details(resource)
                .map(|d| (d.deep_copy(), state.model.version))
        };
        let Some((details, version)) = prepared else {
            debug!(resource = %resource, "resource left the model, skipping fact refresh");
            return;
        };
        let failed = |message: String| FactsReport {
            resource_id: resource.clone(),
            facts: Default::default(),
            messages: vec![LogLine::error(message)],
            success: false,
        };
        let report = match self.executor_for(agent, version).await {
            Ok(executor) => match timeout(self.shared.rpc_timeout, executor.get_facts(&details)).await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => failed(format!("fact refresh failed: {e}")),
                Err(_) => failed(format!(
                    "fact refresh failed: {}",
                    ExecutorError::Timeout(self.shared.rpc_timeout)
                )),
            },
            Err(e) => failed(format!("could not obtain an executor: {e}")),
        };
        if let Err(e) = self.shared.store.store_facts(self.shared.environment, report).await {
            warn!(resource = %resource, error = %e, "could not store facts");
        }
    }
}
