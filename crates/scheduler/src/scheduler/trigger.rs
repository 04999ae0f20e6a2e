//! Deploy and repair triggers, timer events, dry-runs and fact refreshes.

use std::collections::{BTreeSet, HashSet};

use converge_core::{DryRunReport, LogLine, ResourceId};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::ResourceScheduler;
use crate::error::SchedulerError;
use crate::state::Blocked;
use crate::task::{DeployReason, Task, TaskPriority};
use crate::timers::TimerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// At least one agent received the trigger.
    Ok,
    /// None of the agents could be reached.
    NotFound,
}

/// Outcome of a deploy or repair trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerResult {
    pub status: TriggerStatus,
    pub agents_reached: Vec<String>,
    pub warnings: Vec<String>,
}

impl TriggerResult {
    pub fn status_code(&self) -> u16 {
        match self.status {
            TriggerStatus::Ok => 200,
            TriggerStatus::NotFound => 404,
        }
    }
}

impl ResourceScheduler {
    /// Deploy the resources that are not compliant, on every agent.
    pub async fn deploy(&self) -> Result<TriggerResult, SchedulerError> {
        self.trigger(None, false, DeployReason::UserTrigger).await
    }

    /// Redeploy every resource that can be deployed, on every agent.
    pub async fn repair(&self) -> Result<TriggerResult, SchedulerError> {
        self.trigger(None, true, DeployReason::UserTrigger).await
    }

    /// Schedule work for `agents`, or for every agent when `None`.
    ///
    /// With `full` every resource that is not blocked is redeployed, compliant
    /// or not; otherwise only the dirty ones are. Named agents that are not
    /// part of the model and agents that are paused are reported as separate
    /// warnings.
    pub async fn trigger(
        &self,
        agents: Option<&[String]>,
        full: bool,
        reason: DeployReason,
    ) -> Result<TriggerResult, SchedulerError> {
        if let Some(names) = agents {
            if names.is_empty() {
                return Err(SchedulerError::BadRequest("no agents given".to_string()));
            }
            if names.iter().any(|name| name.trim().is_empty()) {
                return Err(SchedulerError::BadRequest("agent names must not be empty".to_string()));
            }
        }
        let priority = if full {
            TaskPriority::UserRepair
        } else {
            TaskPriority::UserDeploy
        };
        self.trigger_with_priority(agents, full, reason, priority).await
    }

    pub(crate) async fn trigger_with_priority(
        &self,
        agents: Option<&[String]>,
        full: bool,
        reason: DeployReason,
        priority: TaskPriority,
    ) -> Result<TriggerResult, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let queues = &self.shared.queues;
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let known = state.model.agents();
        let requested: BTreeSet<String> = match agents {
            Some(names) => names.iter().cloned().collect(),
            None => known.clone(),
        };

        let mut warnings = Vec::new();
        let mut reached = Vec::new();
        for agent in requested {
            if !known.contains(&agent) {
                warnings.push(format!("agent {agent} is not part of the model"));
            } else if state.paused.contains(&agent) {
                warnings.push(format!("agent {agent} is known but not currently connected"));
            } else {
                reached.push(agent);
            }
        }
        if reached.is_empty() {
            debug!(full, "trigger reached no agent");
            return Ok(TriggerResult {
                status: TriggerStatus::NotFound,
                agents_reached: reached,
                warnings,
            });
        }

        let in_scope: Vec<ResourceId> = state
            .model
            .resources()
            .iter()
            .filter(|id| reached.iter().any(|agent| agent == id.agent()))
            .cloned()
            .collect();
        if full {
            for id in &in_scope {
                if let Some(rs) = state.model.states.get_mut(id) {
                    if rs.blocked == Blocked::TemporarilyBlocked {
                        rs.blocked = Blocked::NotBlocked;
                    }
                }
                state.model.mark_dirty(id);
            }
        }
        let dirty: HashSet<ResourceId> = in_scope
            .into_iter()
            .filter(|id| state.model.is_dirty(id))
            .collect();
        let queued = state
            .work
            .deploy_with_context(&dirty, priority, reason, &state.model, queues);
        info!(
            agents = ?reached,
            full,
            scheduled = dirty.len(),
            queued,
            "trigger accepted"
        );
        Ok(TriggerResult {
            status: TriggerStatus::Ok,
            agents_reached: reached,
            warnings,
        })
    }

    /// Schedule a deploy of one resource, compliant or not.
    ///
    /// Returns `false` when the resource is not part of the model or is
    /// blocked.
    pub async fn deploy_resource(&self, id: &ResourceId, reason: DeployReason, priority: TaskPriority) -> bool {
        let queues = &self.shared.queues;
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        if let Some(rs) = state.model.states.get_mut(id) {
            if rs.blocked == Blocked::TemporarilyBlocked {
                rs.blocked = Blocked::NotBlocked;
            }
        }
        if !state.model.mark_dirty(id) {
            debug!(resource = %id, "resource cannot be deployed");
            return false;
        }
        state
            .work
            .deploy_with_context(&HashSet::from([id.clone()]), priority, reason, &state.model, queues);
        true
    }

    /// Queue a dry-run of every resource of `version`, which must be the
    /// current version. Reports are written to the state store under the
    /// returned id.
    pub async fn dry_run(&self, version: u64) -> Result<Uuid, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let dry_run_id = Uuid::new_v4();
        let undefined = {
            let state = self.shared.state.lock().await;
            if state.model.version != version {
                return Err(SchedulerError::BadRequest(format!(
                    "version {version} is not the current version {}",
                    state.model.version
                )));
            }
            let mut undefined = Vec::new();
            for id in state.model.resources() {
                if state.model.state(id).map(|rs| rs.is_undefined).unwrap_or(false) {
                    undefined.push(DryRunReport {
                        resource_id: id.clone(),
                        dry_run_id,
                        model_version: version,
                        changes: Default::default(),
                        messages: vec![LogLine::warning(format!("{id} is undefined, nothing to compare"))],
                        failed: false,
                    });
                    continue;
                }
                let task = Task::DryRun {
                    resource: id.clone(),
                    version,
                    dry_run_id,
                };
                self.shared
                    .queues
                    .put(id.agent(), task, TaskPriority::DryRun, DeployReason::UserTrigger);
            }
            undefined
        };
        if !undefined.is_empty() {
            self.shared.store.store_dry_run(self.shared.environment, undefined).await?;
        }
        info!(version, dry_run = %dry_run_id, "dry-run queued");
        Ok(dry_run_id)
    }

    /// Queue a fact refresh for one resource.
    pub async fn refresh_facts(&self, id: &ResourceId) -> Result<(), SchedulerError> {
        if !self.shared.state.lock().await.model.contains(id) {
            return Err(SchedulerError::BadRequest(format!("resource {id} is not part of the model")));
        }
        self.shared.queues.put(
            id.agent(),
            Task::RefreshFacts { resource: id.clone() },
            TaskPriority::FactRefresh,
            DeployReason::UserTrigger,
        );
        Ok(())
    }

    pub(crate) async fn handle_timer_event(&self, event: TimerEvent) {
        match event {
            TimerEvent::Deploy(id) => {
                self.deploy_resource(&id, DeployReason::PeriodicDeploy, TaskPriority::IntervalDeploy)
                    .await;
            }
            TimerEvent::Repair(id) => {
                self.deploy_resource(&id, DeployReason::PeriodicRepair, TaskPriority::IntervalRepair)
                    .await;
            }
            TimerEvent::GlobalDeploy => {
                if let Err(e) = self
                    .trigger_with_priority(None, false, DeployReason::PeriodicDeploy, TaskPriority::IntervalDeploy)
                    .await
                {
                    warn!(error = %e, "periodic deploy failed");
                }
            }
            TimerEvent::GlobalRepair => {
                if let Err(e) = self
                    .trigger_with_priority(None, true, DeployReason::PeriodicRepair, TaskPriority::IntervalRepair)
                    .await
                {
                    warn!(error = %e, "periodic repair failed");
                }
            }
        }
    }
}
