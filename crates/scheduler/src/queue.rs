//! Per-agent priority queues.
//!
//! Each agent has one queue ordered by priority, then insertion order.
//! Cancelling or re-prioritising a task only drops its bookkeeping entry; the
//! stale heap slot is discarded when it reaches the top.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use converge_core::ResourceId;
use tokio::sync::Notify;
use tracing::trace;

use crate::task::{DeployReason, QueuedTask, Task, TaskPriority};

#[derive(Default)]
struct AgentQueue {
    heap: BinaryHeap<Reverse<(TaskPriority, u64)>>,
    by_seq: HashMap<u64, QueuedTask>,
    by_task: HashMap<Task, u64>,
    in_progress: HashMap<Task, TaskPriority>,
    notify: Arc<Notify>,
}

impl AgentQueue {
    fn pop(&mut self) -> Option<QueuedTask> {
        while let Some(Reverse((_, seq))) = self.heap.pop() {
            // cancelled or superseded entries have no by_seq record left
            if let Some(item) = self.by_seq.remove(&seq) {
                self.by_task.remove(&item.task);
                return Some(item);
            }
        }
        None
    }

    fn cancel(&mut self, task: &Task) -> bool {
        match self.by_task.remove(task) {
            Some(seq) => {
                self.by_seq.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn queued_priority(&self, task: &Task) -> Option<TaskPriority> {
        self.by_task
            .get(task)
            .and_then(|seq| self.by_seq.get(seq))
            .map(|item| item.priority)
    }
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, AgentQueue>,
    next_seq: u64,
}

/// The task queues of every agent of one environment.
#[derive(Default)]
pub struct AgentQueues {
    inner: Mutex<Inner>,
}

impl AgentQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `task` for `agent`.
    ///
    /// A task that is already queued at the same or a better priority is left
    /// alone and `false` is returned; a better priority supersedes the queued
    /// entry. Tasks in progress do not count: the new entry runs after them.
    pub fn put(&self, agent: &str, task: Task, priority: TaskPriority, reason: DeployReason) -> bool {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        let queue = inner.queues.entry(agent.to_string()).or_default();

        match queue.queued_priority(&task) {
            Some(queued) if queued <= priority => return false,
            Some(_) => {
                queue.cancel(&task);
            }
            None => {}
        }

        trace!(agent = %agent, task = %task, priority = ?priority, "queueing task");
        queue.heap.push(Reverse((priority, seq)));
        queue.by_task.insert(task.clone(), seq);
        queue.by_seq.insert(
            seq,
            QueuedTask {
                task,
                priority,
                reason,
                created_at: Utc::now(),
            },
        );
        queue.notify.notify_one();
        inner.next_seq += 1;
        true
    }

    /// Wait for the next task of `agent` and mark it in progress.
    pub async fn get(&self, agent: &str) -> QueuedTask {
        loop {
            let notify = {
                let mut inner = self.lock();
                let queue = inner.queues.entry(agent.to_string()).or_default();
                if let Some(item) = queue.pop() {
                    queue.in_progress.insert(item.task.clone(), item.priority);
                    return item;
                }
                queue.notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Non-blocking variant of [`get`](Self::get).
    pub fn try_get(&self, agent: &str) -> Option<QueuedTask> {
        let mut inner = self.lock();
        let queue = inner.queues.get_mut(agent)?;
        let item = queue.pop()?;
        queue.in_progress.insert(item.task.clone(), item.priority);
        Some(item)
    }

    pub fn task_done(&self, agent: &str, task: &Task) {
        if let Some(queue) = self.lock().queues.get_mut(agent) {
            queue.in_progress.remove(task);
        }
    }

    /// Drop a queued task so it never runs. Returns whether it was queued.
    pub fn cancel(&self, agent: &str, task: &Task) -> bool {
        self.lock()
            .queues
            .get_mut(agent)
            .map(|queue| queue.cancel(task))
            .unwrap_or(false)
    }

    /// Drop every queued task for `resource`.
    pub fn cancel_resource(&self, agent: &str, resource: &ResourceId) -> usize {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(agent) else {
            return 0;
        };
        let doomed: Vec<Task> = queue
            .by_task
            .keys()
            .filter(|task| task.resource() == Some(resource))
            .cloned()
            .collect();
        for task in &doomed {
            queue.cancel(task);
        }
        doomed.len()
    }

    pub fn queued_priority(&self, agent: &str, task: &Task) -> Option<TaskPriority> {
        self.lock().queues.get(agent).and_then(|q| q.queued_priority(task))
    }

    pub fn in_progress_priority(&self, agent: &str, task: &Task) -> Option<TaskPriority> {
        self.lock()
            .queues
            .get(agent)
            .and_then(|q| q.in_progress.get(task).copied())
    }

    pub fn is_queued(&self, agent: &str, task: &Task) -> bool {
        self.queued_priority(agent, task).is_some()
    }

    pub fn is_in_progress(&self, agent: &str, task: &Task) -> bool {
        self.in_progress_priority(agent, task).is_some()
    }

    /// Queued tasks of `agent` in the order they would run.
    pub fn queued_tasks(&self, agent: &str) -> Vec<QueuedTask> {
        let inner = self.lock();
        let Some(queue) = inner.queues.get(agent) else {
            return Vec::new();
        };
        let mut entries: Vec<(&u64, &QueuedTask)> = queue.by_seq.iter().collect();
        entries.sort_by_key(|(seq, item)| (item.priority, **seq));
        entries.into_iter().map(|(_, item)| item.clone()).collect()
    }

    pub fn len(&self, agent: &str) -> usize {
        self.lock().queues.get(agent).map(|q| q.by_seq.len()).unwrap_or(0)
    }

    /// Number of queued tasks per agent.
    pub fn lengths(&self) -> BTreeMap<String, usize> {
        self.lock()
            .queues
            .iter()
            .map(|(agent, queue)| (agent.clone(), queue.by_seq.len()))
            .collect()
    }

    /// Nothing queued and nothing in progress for any agent.
    pub fn is_idle(&self) -> bool {
        self.lock()
            .queues
            .values()
            .all(|q| q.by_seq.is_empty() && q.in_progress.is_empty())
    }

    /// Ask the worker loop of `agent` to exit after its current task.
    pub fn send_shutdown(&self, agent: &str) {
        self.put(agent, Task::PoisonPill, TaskPriority::Terminated, DeployReason::UserTrigger);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn deploy(name: &str) -> Task {
        Task::deploy(ResourceId::parse(format!("t::R[a,k={name}]")).unwrap())
    }

    fn drain(queues: &AgentQueues) -> Vec<Task> {
        std::iter::from_fn(|| queues.try_get("a")).map(|item| item.task).collect()
    }

    #[test]
    fn priority_first_then_insertion_order() {
        let queues = AgentQueues::new();
        queues.put("a", deploy("slow1"), TaskPriority::IntervalRepair, DeployReason::PeriodicRepair);
        queues.put("a", deploy("first"), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        queues.put("a", deploy("slow2"), TaskPriority::IntervalRepair, DeployReason::PeriodicRepair);
        queues.put("a", deploy("second"), TaskPriority::UserDeploy, DeployReason::UserTrigger);

        assert_eq!(
            drain(&queues),
            vec![deploy("first"), deploy("second"), deploy("slow1"), deploy("slow2")]
        );
    }

    #[test]
    fn equal_or_worse_priority_is_a_no_op() {
        let queues = AgentQueues::new();
        assert!(queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::UserTrigger));
        assert!(!queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::Increment));
        assert!(!queues.put("a", deploy("x"), TaskPriority::IntervalDeploy, DeployReason::PeriodicDeploy));

        let item = queues.try_get("a").unwrap();
        assert_eq!(item.reason, DeployReason::UserTrigger);
        assert!(queues.try_get("a").is_none());
    }

    #[test]
    fn better_priority_supersedes_queued_entry() {
        let queues = AgentQueues::new();
        queues.put("a", deploy("x"), TaskPriority::IntervalRepair, DeployReason::PeriodicRepair);
        queues.put("a", deploy("y"), TaskPriority::UserRepair, DeployReason::UserTrigger);
        assert!(queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::UserTrigger));
        assert_eq!(queues.len("a"), 2);

        // the superseded entry is discarded, so x runs exactly once
        assert_eq!(drain(&queues), vec![deploy("x"), deploy("y")]);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let queues = AgentQueues::new();
        queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        queues.put("a", deploy("y"), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        assert!(queues.cancel("a", &deploy("x")));
        assert!(!queues.cancel("a", &deploy("x")));
        assert_eq!(drain(&queues), vec![deploy("y")]);
    }

    #[test]
    fn in_progress_task_can_be_queued_again() {
        let queues = AgentQueues::new();
        queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        let running = queues.try_get("a").unwrap();
        assert_eq!(
            queues.in_progress_priority("a", &running.task),
            Some(TaskPriority::UserDeploy)
        );

        assert!(queues.put("a", deploy("x"), TaskPriority::IntervalDeploy, DeployReason::PeriodicDeploy));
        queues.task_done("a", &running.task);
        assert!(!queues.is_in_progress("a", &running.task));
        assert_eq!(drain(&queues), vec![deploy("x")]);
    }

    #[test]
    fn cancel_resource_drops_every_kind_of_task() {
        let queues = AgentQueues::new();
        let id = ResourceId::parse("t::R[a,k=x]").unwrap();
        queues.put("a", Task::deploy(id.clone()), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        queues.put(
            "a",
            Task::RefreshFacts { resource: id.clone() },
            TaskPriority::FactRefresh,
            DeployReason::UserTrigger,
        );
        queues.put("a", deploy("other"), TaskPriority::UserDeploy, DeployReason::UserTrigger);

        assert_eq!(queues.cancel_resource("a", &id), 2);
        assert_eq!(drain(&queues), vec![deploy("other")]);
    }

    #[test]
    fn poison_pill_jumps_the_queue() {
        let queues = AgentQueues::new();
        queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        queues.send_shutdown("a");
        assert_eq!(queues.try_get("a").unwrap().task, Task::PoisonPill);
    }

    #[tokio::test]
    async fn get_waits_for_put() {
        let queues = Arc::new(AgentQueues::new());
        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.get("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queues.put("a", deploy("x"), TaskPriority::UserDeploy, DeployReason::UserTrigger);
        let item = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(item.task, deploy("x"));
        assert!(queues.is_in_progress("a", &deploy("x")));
    }
}
