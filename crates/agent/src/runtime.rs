//! Wiring a scheduler from configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use converge_core::{
    AgentConfig, DesiredState, ExecutorManager, ExecutorMode, HandlerRegistry, StaticCodeResolver,
};
use converge_pool::{LocalExecutorManager, ProcessExecutorManager, RequirementsFileInstaller};
use converge_scheduler::{validate_model, InMemoryStateStore, ResourceScheduler};
use tracing::{info, warn};

/// Load the agent config from `path`, or defaults when the file is missing.
///
/// Environment overrides are applied either way.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if path.exists() {
        let config = AgentConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
        info!(path = %path.display(), "loaded agent config");
        return Ok(config);
    }
    warn!(path = %path.display(), "config file not found, using defaults");
    let mut config = AgentConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Read a desired-state snapshot from a JSON file and check it.
pub fn load_desired_state(path: &Path) -> Result<DesiredState> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let desired: DesiredState =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    validate_model(&desired).with_context(|| format!("validating {}", path.display()))?;
    Ok(desired)
}

pub fn executor_manager(config: &AgentConfig, registry: HandlerRegistry) -> Arc<dyn ExecutorManager> {
    match config.executor_mode {
        ExecutorMode::InProcess => {
            info!(cap = config.executor_cap, "running deploy code in process");
            Arc::new(LocalExecutorManager::in_process(
                registry,
                config.executor_cap,
                config.executor_retention(),
            ))
        }
        ExecutorMode::Process => {
            info!(
                binary = %config.executor_binary.display(),
                cap = config.executor_cap,
                "running deploy code in executor processes"
            );
            Arc::new(ProcessExecutorManager::with_processes(
                config,
                Arc::new(RequirementsFileInstaller),
            ))
        }
    }
}

/// A scheduler with an in-memory state store. Not started yet.
pub fn build_scheduler(
    config: &AgentConfig,
    registry: HandlerRegistry,
) -> (ResourceScheduler, Arc<InMemoryStateStore>) {
    let store = Arc::new(InMemoryStateStore::new());
    let scheduler = ResourceScheduler::new(
        config,
        executor_manager(config, registry),
        Arc::new(StaticCodeResolver::new()),
        store.clone(),
    );
    (scheduler, store)
}

/// Wait until nothing is queued or running; `false` on timeout.
pub async fn wait_idle(scheduler: &ResourceScheduler, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if scheduler.is_idle().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use converge_core::{ResourceId, ResourceIntent};

    use super::*;
    use crate::handlers::builtin_registry;

    #[test]
    fn desired_state_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(
            &path,
            r#"{"version": 3, "resources": [
                {"id": "std::Null[a,name=x]"},
                {"id": "std::Null[a,name=y]", "requires": ["std::Null[a,name=x]"]}
            ]}"#,
        )
        .unwrap();
        let desired = load_desired_state(&path).unwrap();
        assert_eq!(desired.version, 3);
        assert_eq!(desired.resources.len(), 2);

        std::fs::write(
            &path,
            r#"{"version": 1, "resources": [{"id": "std::Null[a,name=y]", "requires": ["std::Null[a,name=gone]"]}]}"#,
        )
        .unwrap();
        assert!(load_desired_state(&path).is_err());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/converge.toml")).unwrap();
        assert!(config.executor_cap >= 1);
    }

    #[tokio::test]
    async fn in_process_scheduler_deploys_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let config = AgentConfig {
            executor_mode: ExecutorMode::InProcess,
            ..AgentConfig::default()
        };
        let (scheduler, store) = build_scheduler(&config, builtin_registry());
        scheduler.start().await.unwrap();

        let id = ResourceId::parse(format!("std::File[local,path={}]", path.display())).unwrap();
        let intent = ResourceIntent::new(id.clone())
            .with_attribute("path", path.display().to_string())
            .with_attribute("content", "converged");
        scheduler
            .apply_desired_state(DesiredState::new(1, vec![intent]))
            .await
            .unwrap();
        assert!(wait_idle(&scheduler, Duration::from_secs(10)).await);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "converged");
        let actions = store.actions_for(scheduler.environment(), &id);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].changes["content"].desired, serde_json::json!("converged"));
        scheduler.stop().await;
    }
}
