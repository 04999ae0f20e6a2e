//! Executors hosted in child processes.
//!
//! Three pools stack here:
//!
//! - the agent-facing [`AgentExecutorManager<RemoteExecutor>`] keyed by
//!   [`ExecutorId`], with cap and idle retention;
//! - the process pool keyed by [`ExecutorBlueprint`]: one child process per
//!   code set, each started inside a pooled environment;
//! - inside every [`ProcessMember`], a pool of [`RemoteExecutor`] handles
//!   keyed by [`ExecutorId`], one per agent using that code set.
//!
//! When the inner pool of a process runs empty, the process asks itself to
//! shut down. When its connection drops, every executor it hosts is marked
//! shut down and the child is killed if it does not exit within the grace
//! time.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{
    AgentConfig, DependencyStates, DeployReport, DryRunReport, Executor, ExecutorBlueprint, ExecutorError,
    ExecutorId, FactsReport, ResourceDetails,
};
use converge_ipc::{Connection, IpcError, MethodRegistry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::env::{environment_pool, EnvInstaller, EnvironmentMember, EnvironmentPool};
use crate::error::{ipc_error, PoolError};
use crate::executor_manager::{AgentExecutorManager, ManagedExecutor};
use crate::manager::{CreateMember, PoolManager};
use crate::member::{InFlight, MemberLifecycle, PoolMember};
use crate::protocol::{
    DryRunRequest, ExecuteRequest, FactsRequest, InitExecutor, VersionRequest, CLOSE_EXECUTOR, CLOSE_VERSION,
    DRY_RUN, ENV_DIR_VAR, EXECUTE, GET_FACTS, INIT_EXECUTOR, OPEN_VERSION, STOP,
};

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub binary: PathBuf,
    pub rpc_timeout: Duration,
    pub grace_time: Duration,
}

impl ProcessSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            binary: config.executor_binary.clone(),
            rpc_timeout: config.rpc_timeout(),
            grace_time: config.grace_time(),
        }
    }
}

// ── Remote executor ──────────────────────────────────────────────────

/// Handle on one executor living inside a child process.
pub struct RemoteExecutor {
    id: ExecutorId,
    identity: String,
    connection: Connection,
    rpc_timeout: Duration,
    lifecycle: MemberLifecycle,
    in_flight: AtomicUsize,
}

impl RemoteExecutor {
    async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, ExecutorError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        if !self.lifecycle.running() {
            return Err(ExecutorError::ShuttingDown);
        }
        let _in_flight = InFlight::enter(&self.in_flight);
        self.lifecycle.touch();
        let result = self.connection.call(method, args, self.rpc_timeout).await;
        self.lifecycle.touch();
        result.map_err(ipc_error)
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn execute(
        &self,
        action_id: Uuid,
        resource: &ResourceDetails,
        reason: &str,
        requires: &DependencyStates,
    ) -> Result<DeployReport, ExecutorError> {
        let request = ExecuteRequest {
            executor: self.identity.clone(),
            action_id,
            resource: resource.clone(),
            reason: reason.to_string(),
            requires: requires.clone(),
        };
        self.call(EXECUTE, &request).await
    }

    async fn dry_run(
        &self,
        resources: &[ResourceDetails],
        dry_run_id: Uuid,
    ) -> Result<Vec<DryRunReport>, ExecutorError> {
        let request = DryRunRequest {
            executor: self.identity.clone(),
            dry_run_id,
            resources: resources.to_vec(),
        };
        self.call(DRY_RUN, &request).await
    }

    async fn get_facts(&self, resource: &ResourceDetails) -> Result<FactsReport, ExecutorError> {
        let request = FactsRequest {
            executor: self.identity.clone(),
            resource: resource.clone(),
        };
        self.call(GET_FACTS, &request).await
    }

    async fn open_version(&self, version: u64) -> Result<(), ExecutorError> {
        let request = VersionRequest {
            executor: self.identity.clone(),
            version,
        };
        self.call(OPEN_VERSION, &request).await
    }

    async fn close_version(&self, version: u64) -> Result<(), ExecutorError> {
        let request = VersionRequest {
            executor: self.identity.clone(),
            version,
        };
        self.call(CLOSE_VERSION, &request).await
    }
}

#[async_trait]
impl PoolMember for RemoteExecutor {
    fn name(&self) -> String {
        format!("executor {}", self.id)
    }

    fn lifecycle(&self) -> &MemberLifecycle {
        &self.lifecycle
    }

    fn can_be_cleaned_up(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    async fn request_shutdown(&self) {
        if self.lifecycle.mark_shutting_down() && !self.connection.is_closed() {
            if let Err(e) = self.connection.notify(CLOSE_EXECUTOR, &self.identity).await {
                debug!(executor = %self.id, error = %e, "could not notify executor close");
            }
        }
        self.lifecycle.mark_shut_down();
    }
}

impl ManagedExecutor for RemoteExecutor {
    fn executor_id(&self) -> &ExecutorId {
        &self.id
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Inner pool factory: asks the child to set up an executor.
struct RemoteExecutorFactory {
    process: Weak<ProcessMember>,
}

#[async_trait]
impl CreateMember<ExecutorId, RemoteExecutor> for RemoteExecutorFactory {
    async fn create_member(&self, key: &ExecutorId) -> Result<Arc<RemoteExecutor>, PoolError> {
        let process = self
            .process
            .upgrade()
            .filter(|p| p.running())
            .ok_or_else(|| PoolError::ShuttingDown(format!("process for {key}")))?;

        let init = InitExecutor {
            executor: key.identity(),
            agent_name: key.agent_name.clone(),
            agent_uri: key.agent_uri.clone(),
            sources: key.blueprint.sources.iter().cloned().collect(),
        };
        process
            .connection
            .call::<_, ()>(INIT_EXECUTOR, &init, process.settings.rpc_timeout)
            .await?;
        debug!(executor = %key, process = %process.label, "executor initialized in process");

        Ok(Arc::new(RemoteExecutor {
            id: key.clone(),
            identity: init.executor,
            connection: process.connection.clone(),
            rpc_timeout: process.settings.rpc_timeout,
            lifecycle: MemberLifecycle::new(),
            in_flight: AtomicUsize::new(0),
        }))
    }

    async fn member_removed(&self, _member: &Arc<RemoteExecutor>, remaining: usize) {
        if remaining > 0 {
            return;
        }
        if let Some(process) = self.process.upgrade().filter(|p| p.running()) {
            debug!(process = %process.label, "last executor gone, stopping process");
            tokio::spawn(async move { process.request_shutdown().await });
        }
    }
}

// ── Process member ───────────────────────────────────────────────────

/// One child process running executors for a single code blueprint.
pub struct ProcessMember {
    label: String,
    blueprint: ExecutorBlueprint,
    connection: Connection,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    env: Arc<EnvironmentMember>,
    executors: Arc<PoolManager<ExecutorId, RemoteExecutor>>,
    settings: ProcessSettings,
    lifecycle: MemberLifecycle,
}

impl ProcessMember {
    #[instrument(skip_all, fields(binary = %settings.binary.display()))]
    async fn spawn(
        blueprint: ExecutorBlueprint,
        env: Arc<EnvironmentMember>,
        settings: ProcessSettings,
    ) -> Result<Arc<Self>, PoolError> {
        let hash = blueprint.blueprint_hash();
        let label = format!("executor-process {}", &hash[..12]);

        let mut child = Command::new(&settings.binary)
            .env(ENV_DIR_VAR, env.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {e}", settings.binary.display())))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("failed to capture executor stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("failed to capture executor stdout".into()))?;
        let pid = child.id();

        let connection = Connection::spawn(label.clone(), stdout, stdin, MethodRegistry::new());
        env.acquire();

        let process = Arc::new_cyclic(|weak: &Weak<ProcessMember>| ProcessMember {
            executors: PoolManager::new(
                format!("{label} executors"),
                Arc::new(RemoteExecutorFactory { process: weak.clone() }),
            ),
            label: label.clone(),
            blueprint,
            connection: connection.clone(),
            child: Mutex::new(Some(child)),
            pid,
            env,
            settings,
            lifecycle: MemberLifecycle::new(),
        });

        let weak = Arc::downgrade(&process);
        connection
            .add_finalizer(async move {
                if let Some(process) = weak.upgrade() {
                    process.terminated().await;
                }
            })
            .await;

        info!(process = %label, pid = ?pid, "started executor process");
        Ok(process)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn blueprint(&self) -> &ExecutorBlueprint {
        &self.blueprint
    }

    /// Inner pool of executors hosted by this process.
    pub fn executors(&self) -> &Arc<PoolManager<ExecutorId, RemoteExecutor>> {
        &self.executors
    }

    /// Connection-lost finalizer: fail every hosted executor and reap the child.
    async fn terminated(&self) {
        self.lifecycle.mark_shutting_down();
        for executor in self.executors.members() {
            executor.lifecycle().mark_shut_down();
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(self.settings.grace_time, child.wait()).await {
                Ok(Ok(status)) => info!(process = %self.label, %status, "executor process exited"),
                Ok(Err(e)) => warn!(process = %self.label, error = %e, "failed to reap executor process"),
                Err(_) => {
                    warn!(process = %self.label, "executor process did not exit in time, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(process = %self.label, error = %e, "failed to kill executor process");
                    }
                }
            }
        }

        self.env.release();
        self.lifecycle.mark_shut_down();
    }
}

#[async_trait]
impl PoolMember for ProcessMember {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn lifecycle(&self) -> &MemberLifecycle {
        &self.lifecycle
    }

    async fn request_shutdown(&self) {
        if !self.lifecycle.mark_shutting_down() {
            return;
        }
        info!(process = %self.label, "stopping executor process");
        self.executors.request_shutdown().await;

        match self.connection.call::<_, ()>(STOP, &(), self.settings.grace_time).await {
            Ok(()) | Err(IpcError::ConnectionLost) => {}
            Err(e) => debug!(process = %self.label, error = %e, "stop call failed"),
        }
        // the child closes its end once the stop reply is out
        if !self.lifecycle.wait_shut_down_for(self.settings.grace_time).await {
            warn!(process = %self.label, "executor process still connected after stop, dropping connection");
            self.connection.abort().await;
        }
    }
}

/// Process pool factory: finds the environment and starts the child.
struct ProcessSpawner {
    settings: ProcessSettings,
    envs: Arc<EnvironmentPool>,
}

#[async_trait]
impl CreateMember<ExecutorBlueprint, ProcessMember> for ProcessSpawner {
    async fn create_member(&self, key: &ExecutorBlueprint) -> Result<Arc<ProcessMember>, PoolError> {
        let env = self.envs.get(&key.env_blueprint()).await?;
        ProcessMember::spawn(key.clone(), env, self.settings.clone()).await
    }
}

pub type ProcessPool = PoolManager<ExecutorBlueprint, ProcessMember>;

/// Top-level factory: the executor for an id lives in the process for its blueprint.
struct ProcessExecutorFactory {
    processes: Arc<ProcessPool>,
    envs: Arc<EnvironmentPool>,
}

#[async_trait]
impl CreateMember<ExecutorId, RemoteExecutor> for ProcessExecutorFactory {
    async fn create_member(&self, key: &ExecutorId) -> Result<Arc<RemoteExecutor>, PoolError> {
        let process = self.processes.get(&key.blueprint).await?;
        match process.executors().get(key).await {
            Err(PoolError::ShuttingDown(_)) | Err(PoolError::Ipc(IpcError::ConnectionLost)) if !process.running() => {
                // raced with that process going away; the pool starts a fresh one
                let process = self.processes.get(&key.blueprint).await?;
                process.executors().get(key).await
            }
            other => other,
        }
    }

    async fn shutdown(&self) {
        self.processes.request_shutdown().await;
        self.envs.stop_cleanup();
    }
}

/// Executor manager running deploy code in child processes.
pub type ProcessExecutorManager = AgentExecutorManager<RemoteExecutor>;

impl AgentExecutorManager<RemoteExecutor> {
    pub fn with_processes(config: &AgentConfig, installer: Arc<dyn EnvInstaller>) -> Self {
        let envs = Arc::new(environment_pool(&config.venv_dir, installer, config.venv_retention()));
        let processes: Arc<ProcessPool> = PoolManager::new(
            "executor-processes",
            Arc::new(ProcessSpawner {
                settings: ProcessSettings::from_config(config),
                envs: envs.clone(),
            }),
        );
        Self::new(
            "process-executors",
            Arc::new(ProcessExecutorFactory { processes, envs }),
            config.executor_cap,
            config.executor_retention(),
        )
    }
}
