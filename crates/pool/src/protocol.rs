//! Method names and argument types spoken between the agent and its
//! executor processes.

use converge_core::{DependencyStates, ModuleSource, ResourceDetails};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const INIT_EXECUTOR: &str = "init_executor";
pub const EXECUTE: &str = "execute";
pub const DRY_RUN: &str = "dry_run";
pub const GET_FACTS: &str = "get_facts";
pub const OPEN_VERSION: &str = "open_version";
pub const CLOSE_VERSION: &str = "close_version";
/// Fire-and-forget: drop one executor inside the process.
pub const CLOSE_EXECUTOR: &str = "close_executor";
/// Ask the process to exit once every pending reply is sent.
pub const STOP: &str = "stop";

/// Environment variable naming the environment directory of a child process.
pub const ENV_DIR_VAR: &str = "CONVERGE_ENV_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitExecutor {
    /// Identity of the executor inside the process.
    pub executor: String,
    pub agent_name: String,
    pub agent_uri: String,
    pub sources: Vec<ModuleSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub executor: String,
    pub action_id: Uuid,
    pub resource: ResourceDetails,
    pub reason: String,
    pub requires: DependencyStates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunRequest {
    pub executor: String,
    pub dry_run_id: Uuid,
    pub resources: Vec<ResourceDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsRequest {
    pub executor: String,
    pub resource: ResourceDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRequest {
    pub executor: String,
    pub version: u64,
}
