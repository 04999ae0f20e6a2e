//! The per-agent worker loop.

use tracing::{debug, instrument};

use crate::scheduler::ResourceScheduler;
use crate::task::Task;

/// Pull tasks for `agent` one at a time until a poison pill arrives.
///
/// Only one of these runs per agent, so an agent never has two tasks in
/// flight and a resource never has two concurrent deploys.
#[instrument(skip_all, fields(agent = %agent))]
pub(crate) async fn run_agent(scheduler: ResourceScheduler, agent: String) {
    debug!("agent worker started");
    loop {
        let item = scheduler.queues().get(&agent).await;
        match item.task.clone() {
            Task::PoisonPill => {
                scheduler.queues().task_done(&agent, &item.task);
                break;
            }
            Task::Deploy { resource } => {
                scheduler.perform_deploy(&agent, item, resource).await;
            }
            Task::DryRun {
                resource,
                version,
                dry_run_id,
            } => {
                scheduler.perform_dry_run(&agent, &resource, version, dry_run_id).await;
                scheduler.queues().task_done(&agent, &item.task);
            }
            Task::RefreshFacts { resource } => {
                scheduler.perform_facts(&agent, &resource).await;
                scheduler.queues().task_done(&agent, &item.task);
            }
        }
    }
    debug!("agent worker stopped");
}
