//! Code install specs and the blueprints derived from them.
//!
//! A blueprint is the identity of an installed code set: two deploys whose
//! blueprints hash the same can share an executor (and an environment).

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, ExecutorError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipConfig {
    #[serde(default)]
    pub index_url: Option<String>,
    #[serde(default)]
    pub extra_index_url: Vec<String>,
    #[serde(default)]
    pub pre: bool,
    #[serde(default)]
    pub use_system_config: bool,
}

/// One source file of a code module, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleSource {
    pub name: String,
    pub hash_value: String,
    #[serde(default)]
    pub is_byte_code: bool,
}

/// What an agent needs installed for one module of one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInstallSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub sources: Vec<ModuleSource>,
    #[serde(default)]
    pub pip_config: PipConfig,
}

fn digest_hex(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("{digest:x}")
}

/// Package environment identity: requirements plus package index settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvBlueprint {
    pub pip_config: PipConfig,
    pub requirements: BTreeSet<String>,
}

impl EnvBlueprint {
    pub fn blueprint_hash(&self) -> String {
        digest_hex(&serde_json::json!({
            "pip_config": self.pip_config,
            "requirements": self.requirements,
        }))
    }
}

impl fmt::Display for EnvBlueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reqs: Vec<&str> = self.requirements.iter().map(String::as_str).collect();
        write!(f, "EnvBlueprint(requirements=[{}])", reqs.join(","))
    }
}

/// Environment plus the module sources loaded on top of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorBlueprint {
    pub env: EnvBlueprint,
    pub sources: BTreeSet<ModuleSource>,
}

impl ExecutorBlueprint {
    /// Merge the install specs of every module an agent needs.
    ///
    /// All specs must agree on the pip config; an empty spec list yields the
    /// empty blueprint.
    pub fn from_specs(code: &[ModuleInstallSpec]) -> Result<Self, ExecutorError> {
        let mut blueprint = Self::default();
        if let Some(first) = code.first() {
            blueprint.env.pip_config = first.pip_config.clone();
        }
        for spec in code {
            if spec.pip_config != blueprint.env.pip_config {
                return Err(ExecutorError::Code(format!(
                    "module '{}' uses a different pip config than the other modules of this agent",
                    spec.name
                )));
            }
            blueprint
                .env
                .requirements
                .extend(spec.requirements.iter().cloned());
            blueprint.sources.extend(spec.sources.iter().cloned());
        }
        Ok(blueprint)
    }

    pub fn blueprint_hash(&self) -> String {
        let sources: Vec<_> = self
            .sources
            .iter()
            .map(|s| serde_json::json!([s.hash_value, s.name, s.is_byte_code]))
            .collect();
        digest_hex(&serde_json::json!({
            "pip_config": self.env.pip_config,
            "requirements": self.env.requirements,
            "sources": sources,
        }))
    }

    pub fn env_blueprint(&self) -> EnvBlueprint {
        self.env.clone()
    }
}

/// Key of a single executor: one agent running one code set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorId {
    pub agent_name: String,
    pub agent_uri: String,
    pub blueprint: ExecutorBlueprint,
}

impl ExecutorId {
    pub fn new(agent_name: impl Into<String>, agent_uri: impl Into<String>, blueprint: ExecutorBlueprint) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_uri: agent_uri.into(),
            blueprint,
        }
    }

    pub fn identity(&self) -> String {
        format!(
            "{}{}{}",
            self.agent_name,
            self.agent_uri,
            self.blueprint.blueprint_hash()
        )
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = self.blueprint.blueprint_hash();
        write!(f, "{}@{}", self.agent_name, &hash[..12])
    }
}

/// Resolves which code modules an agent needs for a model version.
#[async_trait]
pub trait CodeResolver: Send + Sync {
    async fn get_install_spec(
        &self,
        environment: Uuid,
        model_version: u64,
        agent_name: &str,
    ) -> Result<Vec<ModuleInstallSpec>, CoreError>;
}

/// Resolver backed by a fixed per-agent table; agents not in the table need no code.
#[derive(Debug, Clone, Default)]
pub struct StaticCodeResolver {
    per_agent: HashMap<String, Vec<ModuleInstallSpec>>,
    fallback: Vec<ModuleInstallSpec>,
}

impl StaticCodeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: impl Into<String>, specs: Vec<ModuleInstallSpec>) -> Self {
        self.per_agent.insert(agent.into(), specs);
        self
    }

    /// Specs returned for every agent without its own entry.
    pub fn with_fallback(mut self, specs: Vec<ModuleInstallSpec>) -> Self {
        self.fallback = specs;
        self
    }
}

#[async_trait]
impl CodeResolver for StaticCodeResolver {
    async fn get_install_spec(
        &self,
        _environment: Uuid,
        _model_version: u64,
        agent_name: &str,
    ) -> Result<Vec<ModuleInstallSpec>, CoreError> {
        Ok(self
            .per_agent
            .get(agent_name)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, reqs: &[&str], sources: &[&str]) -> ModuleInstallSpec {
        ModuleInstallSpec {
            name: name.into(),
            version: "1.0.0".into(),
            requirements: reqs.iter().map(|r| r.to_string()).collect(),
            sources: sources
                .iter()
                .map(|s| ModuleSource {
                    name: s.to_string(),
                    hash_value: format!("h-{s}"),
                    is_byte_code: false,
                })
                .collect(),
            pip_config: PipConfig::default(),
        }
    }

    #[test]
    fn blueprint_hash_is_order_independent() {
        let a = ExecutorBlueprint::from_specs(&[spec("a", &["x", "y"], &["s1"]), spec("b", &["z"], &["s2"])]).unwrap();
        let b = ExecutorBlueprint::from_specs(&[spec("b", &["z"], &["s2"]), spec("a", &["y", "x", "x"], &["s1"])]).unwrap();
        assert_eq!(a.blueprint_hash(), b.blueprint_hash());
        assert_eq!(a.env.blueprint_hash(), b.env.blueprint_hash());
    }

    #[test]
    fn sources_change_executor_but_not_env_hash() {
        let a = ExecutorBlueprint::from_specs(&[spec("a", &["x"], &["s1"])]).unwrap();
        let b = ExecutorBlueprint::from_specs(&[spec("a", &["x"], &["s2"])]).unwrap();
        assert_ne!(a.blueprint_hash(), b.blueprint_hash());
        assert_eq!(a.env.blueprint_hash(), b.env.blueprint_hash());
    }

    #[test]
    fn mixed_pip_configs_are_rejected() {
        let mut other = spec("b", &[], &[]);
        other.pip_config.pre = true;
        let err = ExecutorBlueprint::from_specs(&[spec("a", &[], &[]), other]).unwrap_err();
        assert!(matches!(err, ExecutorError::Code(_)));
    }

    #[tokio::test]
    async fn static_resolver_uses_fallback() {
        let resolver = StaticCodeResolver::new()
            .with_agent("special", vec![spec("a", &[], &[])])
            .with_fallback(vec![spec("b", &[], &[]), spec("c", &[], &[])]);
        let env = Uuid::new_v4();
        assert_eq!(resolver.get_install_spec(env, 1, "special").await.unwrap().len(), 1);
        assert_eq!(resolver.get_install_spec(env, 1, "other").await.unwrap().len(), 2);
    }
}
