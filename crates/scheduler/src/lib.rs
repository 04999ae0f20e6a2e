//! Resource scheduler of the deployment engine.
//!
//! Keeps the in-memory model of one environment, decides which resources
//! need a deploy, orders those deploys along the dependency graph and feeds
//! them to one worker loop per agent. Executors come from a
//! [`converge_core::ExecutorManager`]; state changes and deploy history go to
//! a [`StateStore`].

pub mod error;
pub mod persistence;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod timers;
pub mod work;
mod worker;

pub use error::SchedulerError;
pub use persistence::{InMemoryStateStore, PersistedResourceState, ResourceAction, StateStore};
pub use queue::AgentQueues;
pub use scheduler::{
    ApplySummary, Discrepancy, ResourceScheduler, ResourceStatus, SchedulerStatus, TriggerResult, TriggerStatus,
    AGENT_URI,
};
pub use state::{validate_model, Blocked, Compliance, ModelState, ResourceState};
pub use task::{DeployReason, QueuedTask, Task, TaskPriority};
pub use timers::{TimerEvent, TimerKind, TimerManager};
pub use work::{BlockedDeploy, ScheduledWork};
