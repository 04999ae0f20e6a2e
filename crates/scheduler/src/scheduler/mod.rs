//! The resource scheduler.
//!
//! Split across submodules:
//! - `core`: the scheduler handle, start/stop and agent worker management
//! - `intent`: applying new desired-state versions
//! - `trigger`: deploy/repair triggers, timers, dry-runs and fact refreshes
//! - `execution`: running one task on an executor and folding the result back
//! - `status`: the status report

mod core;
mod execution;
mod intent;
mod status;
mod trigger;


pub use self::core::{ResourceScheduler, AGENT_URI};
pub use self::intent::ApplySummary;
pub use self::status::{Discrepancy, ResourceStatus, SchedulerStatus};
pub use self::trigger::{TriggerResult, TriggerStatus};
