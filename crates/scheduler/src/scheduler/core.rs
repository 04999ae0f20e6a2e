//! [`ResourceScheduler`]: the handle, its shared state and agent lifecycle.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use converge_core::{AgentConfig, CodeResolver, ExecutorManager, IntervalSetting, ResourceId};
use converge_pool::IsolatedExecutorManager;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::persistence::{PersistedResourceState, StateStore};
use crate::queue::AgentQueues;
use crate::state::ModelState;
use crate::timers::{TimerEvent, TimerManager};
use crate::work::ScheduledWork;
use crate::worker::run_agent;

/// Agent URI handed to the executor manager for every agent.
pub const AGENT_URI: &str = "local:";

/// Everything guarded by the scheduler lock.
pub(crate) struct SchedulerState {
    pub(crate) model: ModelState,
    pub(crate) work: ScheduledWork,
    pub(crate) timers: TimerManager,
    pub(crate) paused: BTreeSet<String>,
    /// Persisted state loaded on start, consumed when a resource first shows up.
    pub(crate) restored: HashMap<ResourceId, PersistedResourceState>,
}

pub(crate) struct Shared {
    pub(crate) environment: Uuid,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) queues: AgentQueues,
    pub(crate) executors: IsolatedExecutorManager,
    pub(crate) code: Arc<dyn CodeResolver>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) rpc_timeout: Duration,
    pub(crate) running: AtomicBool,
    /// Off when tasks are taken from the queues by hand instead of by worker loops.
    pub(crate) spawn_workers: AtomicBool,
    pub(crate) workers: Mutex<HashMap<String, JoinHandle<()>>>,
    timer_events: StdMutex<Option<mpsc::UnboundedReceiver<TimerEvent>>>,
    timer_loop: StdMutex<Option<JoinHandle<()>>>,
    /// Model version each agent's executors were last opened for.
    pub(crate) opened_versions: StdMutex<HashMap<String, u64>>,
}

/// Decides what to deploy, when and in which order, for one environment.
///
/// Cheap to clone; every clone drives the same scheduler.
#[derive(Clone)]
pub struct ResourceScheduler {
    pub(crate) shared: Arc<Shared>,
}

impl ResourceScheduler {
    /// Build a stopped scheduler. Every executor it obtains from `executors`
    /// is wrapped in an isolation layer.
    pub fn new(
        config: &AgentConfig,
        executors: Arc<dyn ExecutorManager>,
        code: Arc<dyn CodeResolver>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timers = TimerManager::new(config.deploy_interval.clone(), config.repair_interval.clone(), events_tx);
        let state = SchedulerState {
            model: ModelState::new(),
            work: ScheduledWork::new(),
            timers,
            paused: config.paused_agents.iter().cloned().collect(),
            restored: HashMap::new(),
        };
        Self {
            shared: Arc::new(Shared {
                environment: config.environment,
                state: Mutex::new(state),
                queues: AgentQueues::new(),
                executors: IsolatedExecutorManager::new(executors),
                code,
                store,
                rpc_timeout: config.rpc_timeout(),
                running: AtomicBool::new(false),
                spawn_workers: AtomicBool::new(true),
                workers: Mutex::new(HashMap::new()),
                timer_events: StdMutex::new(Some(events_rx)),
                timer_loop: StdMutex::new(None),
                opened_versions: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn environment(&self) -> Uuid {
        self.shared.environment
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub(crate) fn queues(&self) -> &AgentQueues {
        &self.shared.queues
    }

    /// Load persisted state, start timers and the worker loops.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let restored = match self.shared.store.load(self.shared.environment).await {
            Ok(restored) => restored,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(environment = %self.shared.environment, restored = restored.len(), "starting scheduler");

        let agents = {
            let mut state = self.shared.state.lock().await;
            state.restored = restored;
            state.timers.start();
            state.model.agents()
        };

        let receiver = self
            .shared
            .timer_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match receiver {
            Some(rx) => {
                let handle = tokio::spawn(timer_loop(Arc::downgrade(&self.shared), rx));
                *self.shared.timer_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            None => warn!("timer events already consumed, scheduler restarted without timers"),
        }

        self.ensure_workers(agents).await;
        Ok(())
    }

    /// Stop timers and worker loops, then every executor.
    ///
    /// Deploys in flight finish first; queued tasks are kept but never run.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(environment = %self.shared.environment, "stopping scheduler");
        if let Some(handle) = self
            .shared
            .timer_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.shared.state.lock().await.timers.stop();

        let mut workers = self.shared.workers.lock().await;
        for agent in workers.keys() {
            self.shared.queues.send_shutdown(agent);
        }
        for (agent, handle) in workers.drain() {
            if let Err(e) = handle.await {
                warn!(agent = %agent, error = %e, "agent worker ended abnormally");
            }
        }
        drop(workers);

        self.shared.executors.stop_all().await;
    }

    /// Start a worker loop for every agent in `agents` that is not paused
    /// and has none yet.
    pub(crate) async fn ensure_workers(&self, agents: impl IntoIterator<Item = String>) {
        if !self.is_running() || !self.shared.spawn_workers.load(Ordering::SeqCst) {
            return;
        }
        let paused = self.shared.state.lock().await.paused.clone();
        let mut workers = self.shared.workers.lock().await;
        for agent in agents {
            if paused.contains(&agent) || workers.contains_key(&agent) {
                continue;
            }
            debug!(agent = %agent, "starting agent worker");
            let handle = tokio::spawn(run_agent(self.clone(), agent.clone()));
            workers.insert(agent, handle);
        }
    }

    /// Stop the worker loop of `agent` after its current task.
    ///
    /// Queued work is kept and resumes with [`resume_agent`](Self::resume_agent).
    pub async fn pause_agent(&self, agent: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.shared.state.lock().await;
            if !state.model.has_agent(agent) {
                return Err(SchedulerError::BadRequest(format!("agent {agent} is not part of the model")));
            }
            if !state.paused.insert(agent.to_string()) {
                return Ok(());
            }
        }
        info!(agent = %agent, "pausing agent");
        let mut workers = self.shared.workers.lock().await;
        if let Some(handle) = workers.remove(agent) {
            self.shared.queues.send_shutdown(agent);
            if let Err(e) = handle.await {
                warn!(agent = %agent, error = %e, "agent worker ended abnormally");
            }
        }
        Ok(())
    }

    pub async fn resume_agent(&self, agent: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.shared.state.lock().await;
            if !state.model.has_agent(agent) {
                return Err(SchedulerError::BadRequest(format!("agent {agent} is not part of the model")));
            }
            if !state.paused.remove(agent) {
                return Ok(());
            }
        }
        info!(agent = %agent, "resuming agent");
        self.ensure_workers([agent.to_string()]).await;
        Ok(())
    }

    /// Agents with a live worker loop.
    pub async fn running_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .shared
            .workers
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(agent, _)| agent.clone())
            .collect();
        agents.sort();
        agents
    }

    /// Apply new deploy and repair intervals; every timer is re-armed now.
    pub async fn reload_config(&self, deploy_interval: IntervalSetting, repair_interval: IntervalSetting) {
        info!(deploy = %deploy_interval, repair = %repair_interval, "interval settings changed");
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let live = state.model.states.iter().filter(|(id, _)| state.model.details.contains_key(*id));
        state.timers.reload_config(deploy_interval, repair_interval, live);
    }

    /// No task queued, waiting or running for any agent.
    pub async fn is_idle(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.work.waiting().is_empty() && self.shared.queues.is_idle()
    }

    /// Number of tasks queued for `agent`.
    pub fn queue_length(&self, agent: &str) -> usize {
        self.shared.queues.len(agent)
    }
}

async fn timer_loop(shared: std::sync::Weak<Shared>, mut events: mpsc::UnboundedReceiver<TimerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        ResourceScheduler { shared }.handle_timer_event(event).await;
    }
    debug!("timer loop ended");
}
