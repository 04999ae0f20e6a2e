//! Applying new desired-state versions.

use std::collections::HashSet;

use converge_core::{DesiredState, ResourceDetails, ResourceId};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::core::ResourceScheduler;
use crate::error::SchedulerError;
use crate::persistence::PersistedResourceState;
use crate::state::{validate_model, Blocked, ResourceState};
use crate::task::{DeployReason, TaskPriority};

/// What applying one desired state changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub version: u64,
    pub new: usize,
    pub changed: usize,
    pub orphaned: usize,
    pub unblocked: usize,
    /// Deploys that entered an agent queue or the wait list.
    pub scheduled: usize,
}

impl ResourceScheduler {
    /// Install a new desired-state snapshot and schedule what it changed.
    ///
    /// The snapshot is validated before anything is touched: a snapshot with
    /// duplicate resources, dangling requires or a dependency cycle, or one
    /// older than the current version, is rejected as a whole. Applying the
    /// same snapshot twice schedules nothing the second time.
    pub async fn apply_desired_state(&self, desired: DesiredState) -> Result<ApplySummary, SchedulerError> {
        let order = validate_model(&desired)?;
        let queues = &self.shared.queues;

        let mut guard = self.shared.state.lock().await;
        if desired.version < guard.model.version {
            return Err(SchedulerError::InvalidModel(format!(
                "version {} is older than the current version {}",
                desired.version, guard.model.version
            )));
        }
        let new_version = desired.version > guard.model.version;
        let state = &mut *guard;
        let mut summary = ApplySummary {
            version: desired.version,
            ..Default::default()
        };

        let incoming: HashSet<&ResourceId> = desired.resources.iter().map(|r| &r.id).collect();
        let removed: Vec<ResourceId> = state
            .model
            .details
            .keys()
            .filter(|id| !incoming.contains(id))
            .cloned()
            .collect();
        for id in &removed {
            debug!(resource = %id, "resource left the model");
            state.model.remove_resource(id);
            state.work.delete_resource(id, queues);
            queues.cancel_resource(id.agent(), id);
            state.timers.remove_timer(id);
        }
        summary.orphaned = removed.len();

        // resources whose intent moved, to be re-evaluated below
        let mut touched: Vec<ResourceId> = Vec::new();
        for intent in &desired.resources {
            let id = &intent.id;
            let hash = intent.attribute_hash();
            let present = state.model.details.contains_key(id);
            match state.model.states.get_mut(id) {
                Some(rs) if present => {
                    if rs.intent_hash != hash || rs.is_undefined != intent.undefined {
                        rs.intent_hash = hash;
                        rs.is_undefined = intent.undefined;
                        if rs.blocked == Blocked::TemporarilyBlocked {
                            rs.blocked = Blocked::NotBlocked;
                        }
                        summary.changed += 1;
                        touched.push(id.clone());
                    }
                }
                Some(rs) => {
                    // orphan coming back
                    rs.is_orphan = false;
                    rs.intent_hash = hash;
                    rs.is_undefined = intent.undefined;
                    rs.blocked = Blocked::NotBlocked;
                    summary.new += 1;
                    touched.push(id.clone());
                }
                None => {
                    let mut rs = ResourceState::new(hash, intent.undefined);
                    if let Some(persisted) = state.restored.remove(id) {
                        restore(&mut rs, &persisted);
                    }
                    state.model.states.insert(id.clone(), rs);
                    summary.new += 1;
                    touched.push(id.clone());
                }
            }
            state
                .model
                .details
                .insert(id.clone(), ResourceDetails::from_intent(intent, desired.version));
            state.model.set_requires(id, intent.requires.clone());
        }
        state.model.version = desired.version;
        state.model.order = order;

        for id in &touched {
            let deployable = state
                .model
                .states
                .get(id)
                .map(|rs| !rs.is_compliant() && rs.blocked == Blocked::NotBlocked)
                .unwrap_or(false);
            if deployable {
                state.model.dirty.insert(id.clone());
            } else {
                state.model.dirty.remove(id);
            }
        }
        let unblocked = state.model.refresh_blocked();
        summary.unblocked = unblocked.len();

        // a new version re-evaluates every dirty resource, touched or not
        let mut to_schedule: HashSet<ResourceId> = if new_version {
            state
                .model
                .dirty
                .iter()
                .filter(|id| {
                    state
                        .model
                        .states
                        .get(*id)
                        .map(|rs| rs.blocked == Blocked::NotBlocked)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        } else {
            HashSet::new()
        };
        for id in touched.iter().chain(unblocked.iter()) {
            if state.model.is_dirty(id) {
                to_schedule.insert(id.clone());
            }
        }
        summary.scheduled = to_schedule.len();
        state.work.deploy_with_context(
            &to_schedule,
            TaskPriority::NewVersionDeploy,
            DeployReason::Increment,
            &state.model,
            queues,
        );

        let mut persist: Vec<(ResourceId, PersistedResourceState)> = Vec::new();
        for id in touched.iter().chain(unblocked.iter()).chain(removed.iter()) {
            if let Some(rs) = state.model.states.get(id) {
                state.timers.update_timer(id, rs);
                persist.push((id.clone(), PersistedResourceState::from(rs)));
            }
        }
        for (id, snapshot) in &persist {
            if let Err(e) = self.shared.store.save(self.shared.environment, id, snapshot).await {
                warn!(resource = %id, error = %e, "could not persist resource state");
            }
        }
        let agents = state.model.agents();
        drop(guard);

        info!(
            version = summary.version,
            new = summary.new,
            changed = summary.changed,
            orphaned = summary.orphaned,
            scheduled = summary.scheduled,
            "applied desired state"
        );
        self.ensure_workers(agents).await;
        Ok(summary)
    }
}

/// Carry deploy history over from a previous run.
fn restore(rs: &mut ResourceState, persisted: &PersistedResourceState) {
    rs.deployed_hash = persisted.deployed_hash.clone();
    rs.last_deploy_result = persisted.last_deploy_result;
    rs.last_deployed = persisted.last_deployed;
    if persisted.blocked == Blocked::TemporarilyBlocked && persisted.intent_hash == rs.intent_hash {
        rs.blocked = Blocked::TemporarilyBlocked;
    }
}
