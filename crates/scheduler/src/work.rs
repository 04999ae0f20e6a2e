//! Deploys waiting for their dependencies.
//!
//! A deploy only enters its agent queue once none of its dependencies is
//! queued, waiting or being deployed. Until then it sits in the wait list
//! with the set of dependencies it is blocked on; every finished deploy
//! releases the dependents that were waiting for it.

use std::collections::{HashMap, HashSet};

use converge_core::ResourceId;
use tracing::trace;

use crate::queue::AgentQueues;
use crate::state::{Blocked, ModelState};
use crate::task::{DeployReason, Task, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedDeploy {
    pub priority: TaskPriority,
    pub reason: DeployReason,
    pub blocked_on: HashSet<ResourceId>,
}

#[derive(Debug, Default)]
pub struct ScheduledWork {
    waiting: HashMap<ResourceId, BlockedDeploy>,
}

impl ScheduledWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiting(&self) -> &HashMap<ResourceId, BlockedDeploy> {
        &self.waiting
    }

    pub fn is_waiting(&self, id: &ResourceId) -> bool {
        self.waiting.contains_key(id)
    }

    fn is_scheduled(&self, id: &ResourceId, queues: &AgentQueues) -> bool {
        let task = Task::deploy(id.clone());
        self.waiting.contains_key(id) || queues.is_queued(id.agent(), &task) || queues.is_in_progress(id.agent(), &task)
    }

    /// Schedule deploys for `resources`.
    ///
    /// Resources outside the model or blocked are ignored. A resource whose
    /// dependencies are all settled goes straight to its agent queue;
    /// otherwise it waits. Dependents already sitting in a queue are pulled
    /// back into the wait list when one of their dependencies gets scheduled
    /// here, so they never overtake it.
    pub fn deploy_with_context(
        &mut self,
        resources: &HashSet<ResourceId>,
        priority: TaskPriority,
        reason: DeployReason,
        model: &ModelState,
        queues: &AgentQueues,
    ) -> usize {
        let todo: Vec<&ResourceId> = model
            .resources()
            .iter()
            .filter(|id| resources.contains(*id))
            .filter(|id| {
                model
                    .state(id)
                    .map(|s| s.blocked != Blocked::Blocked)
                    .unwrap_or(false)
            })
            .collect();

        // register first so dependencies scheduled in this same round count
        for id in &todo {
            match self.waiting.get_mut(*id) {
                Some(existing) => {
                    if priority < existing.priority {
                        existing.priority = priority;
                        existing.reason = reason;
                    }
                }
                None => {
                    self.waiting.insert(
                        (*id).clone(),
                        BlockedDeploy {
                            priority,
                            reason,
                            blocked_on: HashSet::new(),
                        },
                    );
                }
            }
        }

        for id in &todo {
            for dependent in model.provides_of(id) {
                let task = Task::deploy(dependent.clone());
                let Some(queued) = queues.queued_priority(dependent.agent(), &task) else {
                    continue;
                };
                // the agent queue holds only one entry per task, so keep its priority
                let requeued_reason = queues
                    .queued_tasks(dependent.agent())
                    .into_iter()
                    .find(|item| item.task == task)
                    .map(|item| item.reason)
                    .unwrap_or(DeployReason::DependencyReady);
                queues.cancel(dependent.agent(), &task);
                trace!(resource = %dependent, dependency = %id, "moving queued deploy back to waiting");
                self.waiting
                    .entry(dependent.clone())
                    .and_modify(|w| {
                        if queued < w.priority {
                            w.priority = queued;
                        }
                    })
                    .or_insert(BlockedDeploy {
                        priority: queued,
                        reason: requeued_reason,
                        blocked_on: HashSet::new(),
                    });
            }
        }

        let candidates: Vec<ResourceId> = self.waiting.keys().cloned().collect();
        let mut queued = 0;
        for id in candidates {
            let blocked_on: HashSet<ResourceId> = model
                .requires_of(&id)
                .filter(|dep| self.is_scheduled(dep, queues))
                .cloned()
                .collect();
            if blocked_on.is_empty() {
                if let Some(work) = self.waiting.remove(&id) {
                    if queues.put(id.agent(), Task::deploy(id.clone()), work.priority, work.reason) {
                        queued += 1;
                    }
                }
            } else if let Some(work) = self.waiting.get_mut(&id) {
                work.blocked_on = blocked_on;
            }
        }
        queued
    }

    /// A deploy of `id` finished: release the dependents waiting for it.
    pub fn finished_deploy(&mut self, id: &ResourceId, queues: &AgentQueues) {
        let still_scheduled = self.is_scheduled(id, queues);
        let released: Vec<ResourceId> = self
            .waiting
            .iter_mut()
            .filter_map(|(waiter, work)| {
                if still_scheduled || !work.blocked_on.remove(id) {
                    return None;
                }
                work.blocked_on.is_empty().then(|| waiter.clone())
            })
            .collect();
        for waiter in released {
            if let Some(work) = self.waiting.remove(&waiter) {
                trace!(resource = %waiter, dependency = %id, "dependencies settled, queueing deploy");
                queues.put(waiter.agent(), Task::deploy(waiter.clone()), work.priority, work.reason);
            }
        }
    }

    /// Forget all work for `id`, releasing anything that waited on it.
    pub fn delete_resource(&mut self, id: &ResourceId, queues: &AgentQueues) {
        self.waiting.remove(id);
        queues.cancel(id.agent(), &Task::deploy(id.clone()));
        self.finished_deploy(id, queues);
    }
}

#[cfg(test)]
mod tests {
    use converge_core::{DesiredState, ResourceDetails, ResourceIntent};

    use super::*;
    use crate::state::{validate_model, ResourceState};

    fn rid(name: &str) -> ResourceId {
        ResourceId::parse(format!("t::R[a,k={name}]")).unwrap()
    }

    /// key1 <- key2 <- key3, plus an unrelated `free`.
    fn chain() -> ModelState {
        let desired = DesiredState::new(
            1,
            vec![
                ResourceIntent::new(rid("key1")),
                ResourceIntent::new(rid("key2")).requiring(rid("key1")),
                ResourceIntent::new(rid("key3")).requiring(rid("key2")),
                ResourceIntent::new(rid("free")),
            ],
        );
        let mut model = ModelState::new();
        model.order = validate_model(&desired).unwrap();
        for intent in &desired.resources {
            model.details.insert(intent.id.clone(), ResourceDetails::from_intent(intent, 1));
            model.states.insert(intent.id.clone(), ResourceState::new(intent.attribute_hash(), false));
            model.set_requires(&intent.id, intent.requires.clone());
        }
        model
    }

    fn all(model: &ModelState) -> HashSet<ResourceId> {
        model.resources().iter().cloned().collect()
    }

    fn next(queues: &AgentQueues) -> Option<ResourceId> {
        queues.try_get("a").and_then(|item| item.task.resource().cloned())
    }

    #[test]
    fn dependents_wait_until_dependencies_finish() {
        let model = chain();
        let queues = AgentQueues::new();
        let mut work = ScheduledWork::new();

        let queued = work.deploy_with_context(&all(&model), TaskPriority::NewVersionDeploy, DeployReason::Increment, &model, &queues);
        assert_eq!(queued, 2);
        assert_eq!(work.waiting()[&rid("key2")].blocked_on, HashSet::from([rid("key1")]));
        assert_eq!(work.waiting()[&rid("key3")].blocked_on, HashSet::from([rid("key2")]));

        let first = next(&queues).unwrap();
        let second = next(&queues).unwrap();
        assert_eq!(HashSet::from([first, second]), HashSet::from([rid("key1"), rid("free")]));
        assert_eq!(next(&queues), None);

        queues.task_done("a", &Task::deploy(rid("key1")));
        work.finished_deploy(&rid("key1"), &queues);
        assert_eq!(next(&queues), Some(rid("key2")));
        assert!(work.is_waiting(&rid("key3")));

        queues.task_done("a", &Task::deploy(rid("key2")));
        work.finished_deploy(&rid("key2"), &queues);
        let item = queues.try_get("a").unwrap();
        assert_eq!(item.task, Task::deploy(rid("key3")));
        assert_eq!(item.priority, TaskPriority::NewVersionDeploy);
        assert!(work.waiting().is_empty());
    }

    #[test]
    fn queued_dependent_moves_back_behind_new_dependency_deploy() {
        let model = chain();
        let queues = AgentQueues::new();
        let mut work = ScheduledWork::new();

        work.deploy_with_context(&HashSet::from([rid("key2")]), TaskPriority::UserDeploy, DeployReason::UserTrigger, &model, &queues);
        assert!(queues.is_queued("a", &Task::deploy(rid("key2"))));

        work.deploy_with_context(&HashSet::from([rid("key1")]), TaskPriority::IntervalDeploy, DeployReason::PeriodicDeploy, &model, &queues);
        assert!(!queues.is_queued("a", &Task::deploy(rid("key2"))));
        let waiting = &work.waiting()[&rid("key2")];
        assert_eq!(waiting.priority, TaskPriority::UserDeploy);
        assert_eq!(waiting.blocked_on, HashSet::from([rid("key1")]));
        assert_eq!(next(&queues), Some(rid("key1")));
    }

    #[test]
    fn dependency_in_progress_blocks_dependent() {
        let model = chain();
        let queues = AgentQueues::new();
        let mut work = ScheduledWork::new();

        queues.put("a", Task::deploy(rid("key1")), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        let running = queues.try_get("a").unwrap();

        work.deploy_with_context(&HashSet::from([rid("key2")]), TaskPriority::UserDeploy, DeployReason::UserTrigger, &model, &queues);
        assert!(work.is_waiting(&rid("key2")));

        queues.task_done("a", &running.task);
        work.finished_deploy(&rid("key1"), &queues);
        assert_eq!(next(&queues), Some(rid("key2")));
    }

    #[test]
    fn deleting_a_dependency_releases_waiters() {
        let model = chain();
        let queues = AgentQueues::new();
        let mut work = ScheduledWork::new();
        work.deploy_with_context(&HashSet::from([rid("key1"), rid("key2")]), TaskPriority::UserDeploy, DeployReason::UserTrigger, &model, &queues);

        work.delete_resource(&rid("key1"), &queues);
        assert_eq!(next(&queues), Some(rid("key2")));
        assert_eq!(next(&queues), None);
    }

    #[test]
    fn blocked_resources_are_never_scheduled() {
        let mut model = chain();
        model.states.get_mut(&rid("free")).unwrap().blocked = Blocked::Blocked;
        let queues = AgentQueues::new();
        let mut work = ScheduledWork::new();
        work.deploy_with_context(&HashSet::from([rid("free")]), TaskPriority::UserDeploy, DeployReason::UserTrigger, &model, &queues);
        assert_eq!(next(&queues), None);
        assert!(work.waiting().is_empty());
    }
}
