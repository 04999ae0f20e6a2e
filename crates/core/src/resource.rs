use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::id::ResourceId;

/// Desired attributes and dependency edges of one resource, as of one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceIntent {
    pub id: ResourceId,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub requires: BTreeSet<ResourceId>,
    /// The compiler could not resolve every attribute of this resource.
    #[serde(default)]
    pub undefined: bool,
}

impl ResourceIntent {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: Map::new(),
            requires: BTreeSet::new(),
            undefined: false,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn requiring(mut self, dependency: ResourceId) -> Self {
        self.requires.insert(dependency);
        self
    }

    pub fn agent(&self) -> &str {
        self.id.agent()
    }

    /// Content hash of the attributes.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal attribute sets always
    /// serialize to the same bytes.
    pub fn attribute_hash(&self) -> String {
        let canonical = Value::Object(self.attributes.clone()).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{digest:x}")
    }
}

/// An immutable snapshot handed over by the intent source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredState {
    pub version: u64,
    pub resources: Vec<ResourceIntent>,
}

impl DesiredState {
    pub fn new(version: u64, resources: Vec<ResourceIntent>) -> Self {
        Self { version, resources }
    }
}

/// The view of a resource shipped to an executor for one deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDetails {
    pub id: ResourceId,
    pub model_version: u64,
    pub attribute_hash: String,
    pub attributes: Arc<Map<String, Value>>,
}

impl ResourceDetails {
    pub fn from_intent(intent: &ResourceIntent, model_version: u64) -> Self {
        Self {
            id: intent.id.clone(),
            model_version,
            attribute_hash: intent.attribute_hash(),
            attributes: Arc::new(intent.attributes.clone()),
        }
    }

    /// Copy that shares no allocation with `self`.
    pub fn deep_copy(&self) -> Self {
        Self {
            id: self.id.clone(),
            model_version: self.model_version,
            attribute_hash: self.attribute_hash.clone(),
            attributes: Arc::new(Map::clone(&self.attributes)),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rid(raw: &str) -> ResourceId {
        ResourceId::parse(raw).unwrap()
    }

    #[test]
    fn hash_ignores_insertion_order_and_requires() {
        let a = ResourceIntent::new(rid("t::R[a,k=1]"))
            .with_attribute("x", 1)
            .with_attribute("y", "two");
        let b = ResourceIntent::new(rid("t::R[a,k=1]"))
            .with_attribute("y", "two")
            .with_attribute("x", 1)
            .requiring(rid("t::R[a,k=0]"));
        assert_eq!(a.attribute_hash(), b.attribute_hash());
    }

    #[test]
    fn hash_changes_with_attributes() {
        let a = ResourceIntent::new(rid("t::R[a,k=1]")).with_attribute("x", 1);
        let b = ResourceIntent::new(rid("t::R[a,k=1]")).with_attribute("x", 2);
        assert_ne!(a.attribute_hash(), b.attribute_hash());
    }

    #[test]
    fn deep_copy_does_not_share_attributes() {
        let intent = ResourceIntent::new(rid("t::R[a,k=1]")).with_attribute("nested", json!({"a": [1, 2]}));
        let details = ResourceDetails::from_intent(&intent, 3);
        let copy = details.deep_copy();
        assert_eq!(copy, details);
        assert!(!Arc::ptr_eq(&copy.attributes, &details.attributes));
    }

    #[test]
    fn desired_state_from_json() {
        let raw = r#"{
            "version": 4,
            "resources": [
                {"id": "t::R[a,k=1]", "attributes": {"v": 1}},
                {"id": "t::R[a,k=2]", "requires": ["t::R[a,k=1]"], "undefined": true}
            ]
        }"#;
        let state: DesiredState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.resources[1].requires.len(), 1);
        assert!(state.resources[1].undefined);
    }
}
