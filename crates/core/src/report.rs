//! Outcome types produced by executors and consumed by the scheduler.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::id::ResourceId;

/// Result of the last finished deploy of a resource, whatever intent it was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployResult {
    /// Never deployed.
    New,
    Deployed,
    Failed,
    Skipped,
}

impl DeployResult {
    /// True for results a dependent may build on.
    pub fn is_good(self) -> bool {
        matches!(self, DeployResult::Deployed | DeployResult::New)
    }
}

impl fmt::Display for DeployResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployResult::New => write!(f, "new"),
            DeployResult::Deployed => write!(f, "deployed"),
            DeployResult::Failed => write!(f, "failed"),
            DeployResult::Skipped => write!(f, "skipped"),
        }
    }
}

/// State reported by a handler for a single deploy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerResourceState {
    Deployed,
    Skipped,
    /// A dependency was not in a good state, nothing was attempted.
    SkippedForDependency,
    Failed,
    /// No handler could be loaded for the resource type.
    Unavailable,
}

impl HandlerResourceState {
    pub fn deploy_result(self) -> DeployResult {
        match self {
            HandlerResourceState::Deployed => DeployResult::Deployed,
            HandlerResourceState::Skipped | HandlerResourceState::SkippedForDependency => {
                DeployResult::Skipped
            }
            HandlerResourceState::Failed | HandlerResourceState::Unavailable => DeployResult::Failed,
        }
    }
}

/// Last known result of every direct dependency, handed to the executor with a deploy.
pub type DependencyStates = BTreeMap<ResourceId, DeployResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub current: Value,
    pub desired: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployReport {
    pub resource_id: ResourceId,
    pub action_id: Uuid,
    pub state: HandlerResourceState,
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub messages: Vec<LogLine>,
}

impl DeployReport {
    /// Report for a deploy that never reached a handler.
    pub fn failed(resource_id: ResourceId, action_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            resource_id,
            action_id,
            state: HandlerResourceState::Failed,
            changes: BTreeMap::new(),
            messages: vec![LogLine::error(message)],
        }
    }

    pub fn result(&self) -> DeployResult {
        self.state.deploy_result()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub resource_id: ResourceId,
    pub dry_run_id: Uuid,
    pub model_version: u64,
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub messages: Vec<LogLine>,
    /// The handler could not compute changes.
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactsReport {
    pub resource_id: ResourceId,
    pub facts: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<LogLine>,
    #[serde(default)]
    pub success: bool,
}
