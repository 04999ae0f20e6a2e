//! Pool of package environments.
//!
//! An environment is a directory under `venv_dir`, named after the hash of
//! its [`EnvBlueprint`]. Executor processes running the same requirements
//! share it, and it outlives them: it is only removed after staying unused
//! for `executor_venv_retention_time`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::EnvBlueprint;
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::manager::CreateMember;
use crate::member::{MemberLifecycle, PoolMember};
use crate::time_based::TimeBasedPoolManager;

const BLUEPRINT_FILE: &str = "blueprint.json";
const READY_MARKER: &str = ".converge_ready";

/// Installs the packages of a blueprint into an environment directory.
#[async_trait]
pub trait EnvInstaller: Send + Sync + 'static {
    async fn install(&self, blueprint: &EnvBlueprint, path: &Path) -> Result<(), PoolError>;
}

/// Writes the requirement list to `requirements.txt` and nothing more.
#[derive(Debug, Default, Clone)]
pub struct RequirementsFileInstaller;

#[async_trait]
impl EnvInstaller for RequirementsFileInstaller {
    async fn install(&self, blueprint: &EnvBlueprint, path: &Path) -> Result<(), PoolError> {
        let mut content = String::new();
        for requirement in &blueprint.requirements {
            content.push_str(requirement);
            content.push('\n');
        }
        tokio::fs::write(path.join("requirements.txt"), content).await?;
        Ok(())
    }
}

pub struct EnvironmentMember {
    blueprint: EnvBlueprint,
    path: PathBuf,
    lifecycle: MemberLifecycle,
    users: AtomicUsize,
}

impl EnvironmentMember {
    pub fn blueprint(&self) -> &EnvBlueprint {
        &self.blueprint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a process running in this environment.
    pub fn acquire(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.touch();
    }

    pub fn release(&self) {
        let _ = self
            .users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.lifecycle.touch();
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolMember for EnvironmentMember {
    fn name(&self) -> String {
        format!("environment {}", self.path.display())
    }

    fn lifecycle(&self) -> &MemberLifecycle {
        &self.lifecycle
    }

    fn can_be_cleaned_up(&self) -> bool {
        self.users() == 0
    }

    async fn request_shutdown(&self) {
        if !self.lifecycle.mark_shutting_down() {
            return;
        }
        info!(path = %self.path.display(), "removing unused environment");
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "failed to remove environment directory");
        }
        self.lifecycle.mark_shut_down();
    }
}

struct EnvironmentBuilder {
    root: PathBuf,
    installer: Arc<dyn EnvInstaller>,
}

impl EnvironmentBuilder {
    /// An existing directory is reused when it finished installing for the
    /// same blueprint.
    async fn is_reusable(&self, path: &Path, blueprint: &EnvBlueprint) -> bool {
        if tokio::fs::metadata(path.join(READY_MARKER)).await.is_err() {
            return false;
        }
        match tokio::fs::read_to_string(path.join(BLUEPRINT_FILE)).await {
            Ok(raw) => serde_json::from_str::<EnvBlueprint>(&raw).is_ok_and(|stored| &stored == blueprint),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CreateMember<EnvBlueprint, EnvironmentMember> for EnvironmentBuilder {
    async fn create_member(&self, key: &EnvBlueprint) -> Result<Arc<EnvironmentMember>, PoolError> {
        let path = self.root.join(key.blueprint_hash());

        if self.is_reusable(&path, key).await {
            debug!(path = %path.display(), "reusing environment");
        } else {
            if tokio::fs::metadata(&path).await.is_ok() {
                warn!(path = %path.display(), "discarding incomplete environment");
                tokio::fs::remove_dir_all(&path).await?;
            }
            tokio::fs::create_dir_all(&path).await?;
            tokio::fs::write(path.join(BLUEPRINT_FILE), serde_json::to_vec_pretty(key)?).await?;
            self.installer
                .install(key, &path)
                .await
                .map_err(|e| PoolError::Environment(format!("installing {key} failed: {e}")))?;
            tokio::fs::write(path.join(READY_MARKER), b"").await?;
            info!(path = %path.display(), requirements = key.requirements.len(), "environment ready");
        }

        Ok(Arc::new(EnvironmentMember {
            blueprint: key.clone(),
            path,
            lifecycle: MemberLifecycle::new(),
            users: AtomicUsize::new(0),
        }))
    }
}

pub type EnvironmentPool = TimeBasedPoolManager<EnvBlueprint, EnvironmentMember>;

/// Build the environment pool rooted at `root`.
pub fn environment_pool(root: impl Into<PathBuf>, installer: Arc<dyn EnvInstaller>, retention: Duration) -> EnvironmentPool {
    TimeBasedPoolManager::new(
        "environments",
        Arc::new(EnvironmentBuilder {
            root: root.into(),
            installer,
        }),
        retention,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingInstaller(AtomicUsize);

    #[async_trait]
    impl EnvInstaller for CountingInstaller {
        async fn install(&self, blueprint: &EnvBlueprint, path: &Path) -> Result<(), PoolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            RequirementsFileInstaller.install(blueprint, path).await
        }
    }

    fn blueprint(reqs: &[&str]) -> EnvBlueprint {
        EnvBlueprint {
            requirements: reqs.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("converge-env-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn creates_directory_with_marker_and_reuses_it() {
        let root = scratch_dir();
        let installer = Arc::new(CountingInstaller(AtomicUsize::new(0)));
        let bp = blueprint(&["requests==2.0"]);

        let pool = environment_pool(&root, installer.clone(), Duration::from_secs(3600));
        let env = pool.get(&bp).await.unwrap();
        assert!(env.path().join(READY_MARKER).exists());
        let reqs = std::fs::read_to_string(env.path().join("requirements.txt")).unwrap();
        assert_eq!(reqs, "requests==2.0\n");

        // a second pool over the same directory picks the environment up again
        let again = environment_pool(&root, installer.clone(), Duration::from_secs(3600));
        let env2 = again.get(&bp).await.unwrap();
        assert_eq!(env2.path(), env.path());
        assert_eq!(installer.0.load(Ordering::SeqCst), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn directory_without_marker_is_reinstalled() {
        let root = scratch_dir();
        let bp = blueprint(&["a"]);
        let path = root.join(bp.blueprint_hash());
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("leftover"), b"x").unwrap();

        let installer = Arc::new(CountingInstaller(AtomicUsize::new(0)));
        let pool = environment_pool(&root, installer.clone(), Duration::from_secs(3600));
        let env = pool.get(&bp).await.unwrap();

        assert_eq!(installer.0.load(Ordering::SeqCst), 1);
        assert!(!env.path().join("leftover").exists());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn environment_in_use_is_not_cleaned_up() {
        let root = scratch_dir();
        let pool = environment_pool(&root, Arc::new(RequirementsFileInstaller), Duration::from_secs(3600));
        let env = pool.get(&blueprint(&[])).await.unwrap();

        env.acquire();
        assert!(!env.can_be_cleaned_up());
        env.release();
        env.release();
        assert_eq!(env.users(), 0);
        assert!(env.can_be_cleaned_up());

        env.request_shutdown().await;
        assert!(env.lifecycle().is_shut_down());
        assert!(!env.path().exists());
        pool.request_shutdown().await;
        let _ = std::fs::remove_dir_all(&root);
    }
}
