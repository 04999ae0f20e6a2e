//! Narrow persistence interface of the scheduler.
//!
//! The scheduler writes every state change and every finished deploy through
//! a [`StateStore`] and reads the state back on start, so it can resume
//! without redeploying resources that were already compliant.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use converge_core::{
    AttributeChange, DeployResult, DryRunReport, FactsReport, HandlerResourceState, LogLine, ResourceId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::state::{Blocked, Compliance, ResourceState};

/// Stored form of a [`ResourceState`], with the compliance it implied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedResourceState {
    pub intent_hash: String,
    #[serde(default)]
    pub deployed_hash: Option<String>,
    pub last_deploy_result: DeployResult,
    #[serde(default)]
    pub last_deployed: Option<DateTime<Utc>>,
    pub blocked: Blocked,
    #[serde(default)]
    pub is_undefined: bool,
    #[serde(default)]
    pub is_orphan: bool,
    #[serde(default)]
    pub compliance: Option<Compliance>,
}

impl From<&ResourceState> for PersistedResourceState {
    fn from(state: &ResourceState) -> Self {
        Self {
            intent_hash: state.intent_hash.clone(),
            deployed_hash: state.deployed_hash.clone(),
            last_deploy_result: state.last_deploy_result,
            last_deployed: state.last_deployed,
            blocked: state.blocked,
            is_undefined: state.is_undefined,
            is_orphan: state.is_orphan,
            compliance: state.compliance(),
        }
    }
}

impl PersistedResourceState {
    /// The last successful deploy was for `intent_hash`.
    pub fn deployed_intent(&self, intent_hash: &str) -> bool {
        self.last_deploy_result == DeployResult::Deployed && self.deployed_hash.as_deref() == Some(intent_hash)
    }
}

/// One finished deploy attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAction {
    pub resource_id: ResourceId,
    pub action_id: Uuid,
    pub model_version: u64,
    pub intent_hash: String,
    pub reason: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub state: HandlerResourceState,
    pub result: DeployResult,
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub messages: Vec<LogLine>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, environment: Uuid) -> Result<HashMap<ResourceId, PersistedResourceState>, SchedulerError>;

    async fn save(
        &self,
        environment: Uuid,
        resource: &ResourceId,
        state: &PersistedResourceState,
    ) -> Result<(), SchedulerError>;

    async fn record_action(&self, environment: Uuid, action: ResourceAction) -> Result<(), SchedulerError>;

    async fn store_dry_run(&self, environment: Uuid, reports: Vec<DryRunReport>) -> Result<(), SchedulerError>;

    async fn store_facts(&self, environment: Uuid, report: FactsReport) -> Result<(), SchedulerError>;
}

#[derive(Debug, Default)]
struct EnvironmentRecords {
    states: HashMap<ResourceId, PersistedResourceState>,
    actions: Vec<ResourceAction>,
    dry_runs: Vec<DryRunReport>,
    facts: HashMap<ResourceId, FactsReport>,
}

/// Store keeping everything in memory. Used by the CLI and by tests.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    environments: Mutex<HashMap<Uuid, EnvironmentRecords>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, EnvironmentRecords>> {
        self.environments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, environment: Uuid, resource: &ResourceId) -> Option<PersistedResourceState> {
        self.lock()
            .get(&environment)
            .and_then(|env| env.states.get(resource).cloned())
    }

    /// Overwrite a stored state behind the scheduler's back.
    pub fn put_state(&self, environment: Uuid, resource: ResourceId, state: PersistedResourceState) {
        self.lock().entry(environment).or_default().states.insert(resource, state);
    }

    pub fn actions(&self, environment: Uuid) -> Vec<ResourceAction> {
        self.lock()
            .get(&environment)
            .map(|env| env.actions.clone())
            .unwrap_or_default()
    }

    /// Finished deploys of one resource, oldest first.
    pub fn actions_for(&self, environment: Uuid, resource: &ResourceId) -> Vec<ResourceAction> {
        self.actions(environment)
            .into_iter()
            .filter(|a| &a.resource_id == resource)
            .collect()
    }

    pub fn dry_runs(&self, environment: Uuid) -> Vec<DryRunReport> {
        self.lock()
            .get(&environment)
            .map(|env| env.dry_runs.clone())
            .unwrap_or_default()
    }

    pub fn facts(&self, environment: Uuid, resource: &ResourceId) -> Option<FactsReport> {
        self.lock()
            .get(&environment)
            .and_then(|env| env.facts.get(resource).cloned())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, environment: Uuid) -> Result<HashMap<ResourceId, PersistedResourceState>, SchedulerError> {
        Ok(self
            .lock()
            .get(&environment)
            .map(|env| env.states.clone())
            .unwrap_or_default())
    }

    async fn save(
        &self,
        environment: Uuid,
        resource: &ResourceId,
        state: &PersistedResourceState,
    ) -> Result<(), SchedulerError> {
        self.put_state(environment, resource.clone(), state.clone());
        Ok(())
    }

    async fn record_action(&self, environment: Uuid, action: ResourceAction) -> Result<(), SchedulerError> {
        self.lock().entry(environment).or_default().actions.push(action);
        Ok(())
    }

    async fn store_dry_run(&self, environment: Uuid, reports: Vec<DryRunReport>) -> Result<(), SchedulerError> {
        self.lock().entry(environment).or_default().dry_runs.extend(reports);
        Ok(())
    }

    async fn store_facts(&self, environment: Uuid, report: FactsReport) -> Result<(), SchedulerError> {
        self.lock()
            .entry(environment)
            .or_default()
            .facts
            .insert(report.resource_id.clone(), report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saved_state_round_trips_per_environment() {
        let store = InMemoryStateStore::new();
        let env = Uuid::new_v4();
        let id = ResourceId::parse("t::R[a,k=1]").unwrap();
        let mut state = ResourceState::new("h1", false);
        state.deployed_hash = Some("h1".into());
        state.last_deploy_result = DeployResult::Deployed;

        let persisted = PersistedResourceState::from(&state);
        assert_eq!(persisted.compliance, Some(Compliance::Compliant));
        assert!(persisted.deployed_intent("h1"));
        assert!(!persisted.deployed_intent("h2"));

        store.save(env, &id, &persisted).await.unwrap();
        assert_eq!(store.load(env).await.unwrap()[&id], persisted);
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[test]
    fn persisted_state_serializes_as_json() {
        let state = PersistedResourceState::from(&ResourceState::new("h", true));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["blocked"], "blocked");
        assert_eq!(json["compliance"], "undefined");
        let back: PersistedResourceState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
