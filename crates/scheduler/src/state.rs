//! In-memory model of the environment: current intent, dependency graph and
//! per-resource deploy state.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use converge_core::{DependencyStates, DeployResult, DesiredState, ResourceDetails, ResourceId};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    /// Last deploy succeeded against the current intent.
    Compliant,
    /// Last deploy against the current intent failed or was skipped.
    NonCompliant,
    /// The current intent was never deployed.
    HasUpdate,
    Undefined,
}

impl fmt::Display for Compliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Compliance::Compliant => "compliant",
            Compliance::NonCompliant => "non_compliant",
            Compliance::HasUpdate => "has_update",
            Compliance::Undefined => "undefined",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Blocked {
    NotBlocked,
    /// Undefined, or depends on something undefined. Only a new intent clears this.
    Blocked,
    /// Skipped because a dependency is not deployed; may recover in this version.
    TemporarilyBlocked,
}

/// Deploy bookkeeping of one resource. Compliance is always derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub intent_hash: String,
    /// Intent hash of the last finished deploy attempt.
    pub deployed_hash: Option<String>,
    pub last_deploy_result: DeployResult,
    pub last_deployed: Option<DateTime<Utc>>,
    pub blocked: Blocked,
    pub is_undefined: bool,
    pub is_orphan: bool,
}

impl ResourceState {
    pub fn new(intent_hash: impl Into<String>, is_undefined: bool) -> Self {
        Self {
            intent_hash: intent_hash.into(),
            deployed_hash: None,
            last_deploy_result: DeployResult::New,
            last_deployed: None,
            blocked: if is_undefined { Blocked::Blocked } else { Blocked::NotBlocked },
            is_undefined,
            is_orphan: false,
        }
    }

    /// `None` for orphans.
    pub fn compliance(&self) -> Option<Compliance> {
        if self.is_orphan {
            return None;
        }
        if self.is_undefined {
            return Some(Compliance::Undefined);
        }
        if self.deployed_hash.as_deref() != Some(self.intent_hash.as_str()) {
            return Some(Compliance::HasUpdate);
        }
        Some(match self.last_deploy_result {
            DeployResult::Deployed => Compliance::Compliant,
            DeployResult::Failed | DeployResult::Skipped => Compliance::NonCompliant,
            DeployResult::New => Compliance::HasUpdate,
        })
    }

    pub fn is_compliant(&self) -> bool {
        self.compliance() == Some(Compliance::Compliant)
    }
}

/// Check a desired state and return its resources in dependency order.
///
/// Rejects duplicate ids, requires on resources outside the snapshot and
/// dependency cycles.
pub fn validate_model(desired: &DesiredState) -> Result<Vec<ResourceId>, SchedulerError> {
    let mut in_degree: HashMap<&ResourceId, usize> = HashMap::new();
    let mut dependents: HashMap<&ResourceId, Vec<&ResourceId>> = HashMap::new();

    for intent in &desired.resources {
        if in_degree.insert(&intent.id, 0).is_some() {
            return Err(SchedulerError::InvalidModel(format!(
                "resource {} appears more than once",
                intent.id
            )));
        }
    }

    for intent in &desired.resources {
        for dep in &intent.requires {
            if dep == &intent.id {
                return Err(SchedulerError::InvalidModel(format!("resource {dep} requires itself")));
            }
            if !in_degree.contains_key(dep) {
                return Err(SchedulerError::InvalidModel(format!(
                    "resource {} requires {dep}, which is not part of version {}",
                    intent.id, desired.version
                )));
            }
            dependents.entry(dep).or_default().push(&intent.id);
        }
        if let Some(deg) = in_degree.get_mut(&intent.id) {
            *deg = intent.requires.len();
        }
    }

    let mut queue: VecDeque<&ResourceId> = desired
        .resources
        .iter()
        .map(|intent| &intent.id)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut sorted = Vec::with_capacity(desired.resources.len());

    while let Some(node) = queue.pop_front() {
        sorted.push(node.clone());
        for &dependent in dependents.get(node).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if sorted.len() != desired.resources.len() {
        let mut in_cycle: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        in_cycle.sort();
        return Err(SchedulerError::InvalidModel(format!(
            "dependency cycle among: {}",
            in_cycle.join(", ")
        )));
    }
    Ok(sorted)
}

/// Everything the scheduler knows about the current version.
#[derive(Debug, Default)]
pub struct ModelState {
    pub version: u64,
    pub(crate) details: HashMap<ResourceId, ResourceDetails>,
    pub(crate) requires: HashMap<ResourceId, BTreeSet<ResourceId>>,
    pub(crate) provides: HashMap<ResourceId, BTreeSet<ResourceId>>,
    /// Includes orphans, which have no details.
    pub(crate) states: HashMap<ResourceId, ResourceState>,
    pub(crate) dirty: HashSet<ResourceId>,
    /// Resources of the current version in dependency order.
    pub(crate) order: Vec<ResourceId>,
}

impl ModelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.details.contains_key(id)
    }

    pub fn details(&self, id: &ResourceId) -> Option<&ResourceDetails> {
        self.details.get(id)
    }

    pub fn state(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.states.get(id)
    }

    pub fn is_dirty(&self, id: &ResourceId) -> bool {
        self.dirty.contains(id)
    }

    pub fn dirty(&self) -> &HashSet<ResourceId> {
        &self.dirty
    }

    /// Resources of the current version, dependencies first.
    pub fn resources(&self) -> &[ResourceId] {
        &self.order
    }

    pub fn agents(&self) -> BTreeSet<String> {
        self.details.keys().map(|id| id.agent().to_string()).collect()
    }

    pub fn has_agent(&self, agent: &str) -> bool {
        self.details.keys().any(|id| id.agent() == agent)
    }

    pub fn requires_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.requires.get(id).into_iter().flatten()
    }

    pub fn provides_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.provides.get(id).into_iter().flatten()
    }

    /// Last deploy result of every direct dependency.
    pub fn dependency_results(&self, id: &ResourceId) -> DependencyStates {
        self.requires_of(id)
            .map(|dep| {
                let result = self
                    .states
                    .get(dep)
                    .map(|s| s.last_deploy_result)
                    .unwrap_or(DeployResult::New);
                (dep.clone(), result)
            })
            .collect()
    }

    /// Mark a deployable resource dirty; blocked and unknown resources are ignored.
    pub(crate) fn mark_dirty(&mut self, id: &ResourceId) -> bool {
        match self.states.get(id) {
            Some(state) if self.details.contains_key(id) && state.blocked != Blocked::Blocked => {
                self.dirty.insert(id.clone());
                true
            }
            _ => false,
        }
    }

    /// Replace the dependency edges of `id`, keeping the reverse index in sync.
    pub(crate) fn set_requires(&mut self, id: &ResourceId, requires: BTreeSet<ResourceId>) {
        if let Some(old) = self.requires.get(id) {
            for dep in old {
                if let Some(provides) = self.provides.get_mut(dep) {
                    provides.remove(id);
                }
            }
        }
        for dep in &requires {
            self.provides.entry(dep.clone()).or_default().insert(id.clone());
        }
        self.requires.insert(id.clone(), requires);
    }

    /// Drop a resource from the current version, keeping its state as an orphan.
    pub(crate) fn remove_resource(&mut self, id: &ResourceId) {
        self.set_requires(id, BTreeSet::new());
        self.requires.remove(id);
        self.provides.remove(id);
        self.details.remove(id);
        self.dirty.remove(id);
        if let Some(state) = self.states.get_mut(id) {
            state.is_orphan = true;
        }
    }

    /// Recompute [`Blocked::Blocked`] for the whole graph.
    ///
    /// A resource is blocked when it is undefined or any of its dependencies
    /// is blocked. Returns the resources that stopped being blocked.
    pub(crate) fn refresh_blocked(&mut self) -> Vec<ResourceId> {
        let mut unblocked = Vec::new();
        for id in &self.order {
            let blocked = self.states.get(id).map(|s| s.is_undefined).unwrap_or(false)
                || self.requires.get(id).into_iter().flatten().any(|dep| {
                    self.states
                        .get(dep)
                        .map(|s| s.blocked == Blocked::Blocked)
                        .unwrap_or(false)
                });
            let Some(state) = self.states.get_mut(id) else {
                continue;
            };
            if blocked {
                state.blocked = Blocked::Blocked;
                self.dirty.remove(id);
            } else if state.blocked == Blocked::Blocked {
                state.blocked = Blocked::NotBlocked;
                if !state.is_compliant() {
                    self.dirty.insert(id.clone());
                }
                unblocked.push(id.clone());
            }
        }
        unblocked
    }
}

#[cfg(test)]
mod tests {
    use converge_core::ResourceIntent;

    use super::*;

    fn rid(name: &str) -> ResourceId {
        ResourceId::parse(format!("t::R[a,k={name}]")).unwrap()
    }

    fn intent(name: &str, requires: &[&str]) -> ResourceIntent {
        requires
            .iter()
            .fold(ResourceIntent::new(rid(name)), |i, dep| i.requiring(rid(dep)))
    }

    #[test]
    fn compliance_follows_hashes_and_result() {
        let mut state = ResourceState::new("h1", false);
        assert_eq!(state.compliance(), Some(Compliance::HasUpdate));

        state.deployed_hash = Some("h1".into());
        state.last_deploy_result = DeployResult::Failed;
        assert_eq!(state.compliance(), Some(Compliance::NonCompliant));

        state.last_deploy_result = DeployResult::Deployed;
        assert_eq!(state.compliance(), Some(Compliance::Compliant));

        state.intent_hash = "h2".into();
        assert_eq!(state.compliance(), Some(Compliance::HasUpdate));

        state.is_undefined = true;
        assert_eq!(state.compliance(), Some(Compliance::Undefined));

        state.is_orphan = true;
        assert_eq!(state.compliance(), None);
    }

    #[test]
    fn validate_orders_dependencies_first() {
        let desired = DesiredState::new(
            1,
            vec![intent("c", &["b"]), intent("b", &["a"]), intent("a", &[])],
        );
        assert_eq!(validate_model(&desired).unwrap(), vec![rid("a"), rid("b"), rid("c")]);
    }

    #[test]
    fn validate_rejects_bad_models() {
        let missing = DesiredState::new(1, vec![intent("a", &["ghost"])]);
        assert!(matches!(validate_model(&missing), Err(SchedulerError::InvalidModel(_))));

        let cycle = DesiredState::new(1, vec![intent("a", &["b"]), intent("b", &["a"])]);
        let err = validate_model(&cycle).unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");

        let duplicate = DesiredState::new(1, vec![intent("a", &[]), intent("a", &[])]);
        assert!(validate_model(&duplicate).is_err());
    }

    #[test]
    fn blocked_spreads_from_undefined_resources() {
        let mut model = ModelState::new();
        let resources = [("a", &[][..], true), ("b", &["a"][..], false), ("c", &[][..], false)];
        for (name, requires, undefined) in resources {
            let id = rid(name);
            model.states.insert(id.clone(), ResourceState::new("h", undefined));
            model.set_requires(&id, requires.iter().map(|d| rid(d)).collect());
            model.order.push(id.clone());
            model.details.insert(
                id.clone(),
                ResourceDetails::from_intent(&ResourceIntent::new(id.clone()), 1),
            );
            model.dirty.insert(id);
        }

        assert!(model.refresh_blocked().is_empty());
        assert_eq!(model.state(&rid("b")).unwrap().blocked, Blocked::Blocked);
        assert!(!model.is_dirty(&rid("b")));
        assert!(model.is_dirty(&rid("c")));
        assert!(!model.mark_dirty(&rid("a")));

        model.states.get_mut(&rid("a")).unwrap().is_undefined = false;
        assert_eq!(model.refresh_blocked(), vec![rid("a"), rid("b")]);
        assert!(model.is_dirty(&rid("b")));
        assert_eq!(model.provides_of(&rid("a")).collect::<Vec<_>>(), vec![&rid("b")]);
    }
}
