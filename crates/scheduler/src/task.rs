//! Work items flowing through the agent queues.

use std::fmt;

use chrono::{DateTime, Utc};
use converge_core::ResourceId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue priority; lower values run first.
///
/// Declaration order is the ordering, so `TaskPriority::UserDeploy <
/// TaskPriority::IntervalRepair`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Terminated,
    UserDeploy,
    NewVersionDeploy,
    UserRepair,
    DryRun,
    IntervalDeploy,
    FactRefresh,
    IntervalRepair,
}

impl TaskPriority {
    pub fn value(self) -> i32 {
        match self {
            TaskPriority::Terminated => -1,
            TaskPriority::UserDeploy => 0,
            TaskPriority::NewVersionDeploy => 1,
            TaskPriority::UserRepair => 2,
            TaskPriority::DryRun => 3,
            TaskPriority::IntervalDeploy => 4,
            TaskPriority::FactRefresh => 5,
            TaskPriority::IntervalRepair => 6,
        }
    }
}

/// Why a resource is being (re)deployed. Shipped to the handler as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployReason {
    UserTrigger,
    PeriodicDeploy,
    PeriodicRepair,
    DependencyReady,
    /// A new desired-state version changed the resource.
    Increment,
}

impl fmt::Display for DeployReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeployReason::UserTrigger => "deploy requested by user",
            DeployReason::PeriodicDeploy => "periodic deploy",
            DeployReason::PeriodicRepair => "periodic repair",
            DeployReason::DependencyReady => "a dependency became ready",
            DeployReason::Increment => "new desired-state version",
        };
        f.write_str(text)
    }
}

/// What a worker loop should do next.
///
/// Two equal tasks are the same unit of work: putting one that is already
/// queued only ever changes its priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Task {
    Deploy {
        resource: ResourceId,
    },
    DryRun {
        resource: ResourceId,
        version: u64,
        dry_run_id: Uuid,
    },
    RefreshFacts {
        resource: ResourceId,
    },
    /// Makes the worker loop exit.
    PoisonPill,
}

impl Task {
    pub fn deploy(resource: ResourceId) -> Self {
        Task::Deploy { resource }
    }

    pub fn resource(&self) -> Option<&ResourceId> {
        match self {
            Task::Deploy { resource } | Task::DryRun { resource, .. } | Task::RefreshFacts { resource } => {
                Some(resource)
            }
            Task::PoisonPill => None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Deploy { resource } => write!(f, "deploy {resource}"),
            Task::DryRun { resource, version, .. } => write!(f, "dry-run {resource} (v{version})"),
            Task::RefreshFacts { resource } => write!(f, "refresh facts {resource}"),
            Task::PoisonPill => write!(f, "stop"),
        }
    }
}

/// A task as handed out by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task: Task,
    pub priority: TaskPriority,
    pub reason: DeployReason,
    pub created_at: DateTime<Utc>,
}
