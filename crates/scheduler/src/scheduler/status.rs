//! Status report of a scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use converge_core::{DeployResult, ResourceId};
use serde::Serialize;
use uuid::Uuid;

use super::core::ResourceScheduler;
use crate::error::SchedulerError;
use crate::persistence::PersistedResourceState;
use crate::state::{Blocked, Compliance, ResourceState};
use crate::task::Task;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub id: ResourceId,
    pub agent: String,
    /// `None` for orphans.
    pub compliance: Option<Compliance>,
    pub blocked: Blocked,
    pub last_deploy_result: DeployResult,
    pub last_deployed: Option<DateTime<Utc>>,
    pub is_undefined: bool,
    pub is_orphan: bool,
    pub dirty: bool,
    pub waiting: bool,
    pub queued: bool,
    pub deploying: bool,
}

/// A field where the in-memory state and the stored state disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub resource: ResourceId,
    pub field: String,
    pub in_memory: String,
    pub persisted: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub environment: Uuid,
    pub version: u64,
    pub running: bool,
    pub resources: Vec<ResourceStatus>,
    pub queue_lengths: BTreeMap<String, usize>,
    pub running_agents: Vec<String>,
    pub paused_agents: Vec<String>,
    pub discrepancies: Vec<Discrepancy>,
}

impl SchedulerStatus {
    pub fn resource(&self, id: &ResourceId) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| &r.id == id)
    }
}

impl ResourceScheduler {
    /// Snapshot of the scheduler, checked against the state store.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let running_agents = self.running_agents().await;
        let state = self.shared.state.lock().await;
        let persisted = self.shared.store.load(self.shared.environment).await?;
        let queues = &self.shared.queues;

        let mut ids: Vec<&ResourceId> = state.model.states.keys().collect();
        ids.sort();
        let mut resources = Vec::with_capacity(ids.len());
        let mut discrepancies = Vec::new();
        for id in ids {
            let Some(rs) = state.model.state(id) else {
                continue;
            };
            let task = Task::deploy(id.clone());
            resources.push(ResourceStatus {
                id: id.clone(),
                agent: id.agent().to_string(),
                compliance: rs.compliance(),
                blocked: rs.blocked,
                last_deploy_result: rs.last_deploy_result,
                last_deployed: rs.last_deployed,
                is_undefined: rs.is_undefined,
                is_orphan: rs.is_orphan,
                dirty: state.model.is_dirty(id),
                waiting: state.work.is_waiting(id),
                queued: queues.is_queued(id.agent(), &task),
                deploying: queues.is_in_progress(id.agent(), &task),
            });
            match persisted.get(id) {
                Some(stored) => compare(id, rs, stored, &mut discrepancies),
                None => discrepancies.push(Discrepancy {
                    resource: id.clone(),
                    field: "state".to_string(),
                    in_memory: "present".to_string(),
                    persisted: "missing".to_string(),
                }),
            }
        }
        let mut stored_only: Vec<&ResourceId> = persisted
            .keys()
            .filter(|id| !state.model.states.contains_key(*id) && !state.restored.contains_key(*id))
            .collect();
        stored_only.sort();
        for id in stored_only {
            discrepancies.push(Discrepancy {
                resource: id.clone(),
                field: "state".to_string(),
                in_memory: "missing".to_string(),
                persisted: "present".to_string(),
            });
        }

        Ok(SchedulerStatus {
            environment: self.shared.environment,
            version: state.model.version,
            running: self.is_running(),
            resources,
            queue_lengths: queues.lengths(),
            running_agents,
            paused_agents: state.paused.iter().cloned().collect(),
            discrepancies,
        })
    }
}

fn compare(id: &ResourceId, memory: &ResourceState, stored: &PersistedResourceState, out: &mut Vec<Discrepancy>) {
    let mut check = |field: &str, in_memory: String, persisted: String| {
        if in_memory != persisted {
            out.push(Discrepancy {
                resource: id.clone(),
                field: field.to_string(),
                in_memory,
                persisted,
            });
        }
    };
    check("intent_hash", memory.intent_hash.clone(), stored.intent_hash.clone());
    check(
        "deployed_hash",
        format!("{:?}", memory.deployed_hash),
        format!("{:?}", stored.deployed_hash),
    );
    check(
        "last_deploy_result",
        memory.last_deploy_result.to_string(),
        stored.last_deploy_result.to_string(),
    );
    check("blocked", format!("{:?}", memory.blocked), format!("{:?}", stored.blocked));
    check("is_orphan", memory.is_orphan.to_string(), stored.is_orphan.to_string());
    check(
        "compliance",
        format!("{:?}", memory.compliance()),
        format!("{:?}", stored.compliance),
    );
}
