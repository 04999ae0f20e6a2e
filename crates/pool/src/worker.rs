//! Entry point of an executor process.
//!
//! The process serves the executor protocol over a byte stream (stdin and
//! stdout in practice) and hosts one [`LocalExecutor`] per executor the
//! agent initializes. It exits when asked to stop, after every pending reply
//! went out, or when the agent side of the connection goes away.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use converge_core::{EnvBlueprint, Executor, ExecutorBlueprint, ExecutorId, HandlerRegistry};
use converge_ipc::{Connection, MethodRegistry, RecordLevel};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::local::LocalExecutor;
use crate::member::PoolMember;
use crate::protocol::{
    DryRunRequest, ExecuteRequest, FactsRequest, InitExecutor, VersionRequest, CLOSE_EXECUTOR, CLOSE_VERSION,
    DRY_RUN, EXECUTE, GET_FACTS, INIT_EXECUTOR, OPEN_VERSION, STOP,
};

/// How long a stopping process waits for the agent to close its end.
const EXIT_GRACE: Duration = Duration::from_secs(5);

const LOGGER: &str = "converge.executor";

struct WorkerState {
    registry: HandlerRegistry,
    executors: Mutex<HashMap<String, Arc<LocalExecutor>>>,
    stop: Notify,
}

impl WorkerState {
    async fn executor(&self, identity: &str) -> Result<Arc<LocalExecutor>, String> {
        self.executors
            .lock()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| format!("no executor '{identity}' in this process"))
    }

    async fn init(&self, args: InitExecutor, conn: Connection) -> Result<(), String> {
        let mut executors = self.executors.lock().await;
        if executors.contains_key(&args.executor) {
            return Ok(());
        }
        let blueprint = ExecutorBlueprint {
            env: EnvBlueprint::default(),
            sources: args.sources.into_iter().collect::<BTreeSet<_>>(),
        };
        let id = ExecutorId::new(args.agent_name, args.agent_uri, blueprint);
        let message = format!("executor for agent {} ready ({} sources)", id.agent_name, id.blueprint.sources.len());
        executors.insert(args.executor, Arc::new(LocalExecutor::new(id, self.registry.clone())));
        drop(executors);

        info!("{message}");
        let _ = conn.send_log(LOGGER, RecordLevel::Info, message).await;
        Ok(())
    }

    async fn close_executor(&self, identity: String) -> Result<(), String> {
        let removed = self.executors.lock().await.remove(&identity);
        if let Some(executor) = removed {
            debug!(executor = %executor.id(), "closing executor");
            executor.request_shutdown().await;
        }
        Ok(())
    }
}

/// Adapt a method on the shared state to the registry's handler shape.
fn bind<A, F, Fut>(state: &Arc<WorkerState>, f: F) -> impl Fn(A, Connection) -> Fut + Send + Sync + 'static
where
    A: 'static,
    F: Fn(Arc<WorkerState>, A, Connection) -> Fut + Send + Sync + 'static,
    Fut: 'static,
{
    let state = state.clone();
    move |args, conn| f(state.clone(), args, conn)
}

fn methods(state: &Arc<WorkerState>) -> MethodRegistry {
    MethodRegistry::new()
        .with(
            INIT_EXECUTOR,
            bind(state, |s, args: InitExecutor, conn| async move { s.init(args, conn).await }),
        )
        .with(
            EXECUTE,
            bind(state, |s, req: ExecuteRequest, _| async move {
                let executor = s.executor(&req.executor).await?;
                executor
                    .execute(req.action_id, &req.resource, &req.reason, &req.requires)
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .with(
            DRY_RUN,
            bind(state, |s, req: DryRunRequest, _| async move {
                let executor = s.executor(&req.executor).await?;
                executor
                    .dry_run(&req.resources, req.dry_run_id)
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .with(
            GET_FACTS,
            bind(state, |s, req: FactsRequest, _| async move {
                let executor = s.executor(&req.executor).await?;
                executor.get_facts(&req.resource).await.map_err(|e| e.to_string())
            }),
        )
        .with(
            OPEN_VERSION,
            bind(state, |s, req: VersionRequest, _| async move {
                let executor = s.executor(&req.executor).await?;
                executor.open_version(req.version).await.map_err(|e| e.to_string())
            }),
        )
        .with(
            CLOSE_VERSION,
            bind(state, |s, req: VersionRequest, _| async move {
                let executor = s.executor(&req.executor).await?;
                executor.close_version(req.version).await.map_err(|e| e.to_string())
            }),
        )
        .with(
            CLOSE_EXECUTOR,
            bind(state, |s, identity: String, _| async move { s.close_executor(identity).await }),
        )
        .with(
            STOP,
            bind(state, |s, _: (), _| async move {
                s.stop.notify_one();
                Ok::<_, String>(())
            }),
        )
}

/// Serve the executor protocol until stopped or disconnected.
pub async fn serve_executor<R, W>(registry: HandlerRegistry, reader: R, writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::new(WorkerState {
        registry,
        executors: Mutex::new(HashMap::new()),
        stop: Notify::new(),
    });
    let connection = Connection::spawn("agent", reader, writer, methods(&state));
    info!("executor process serving");

    tokio::select! {
        _ = state.stop.notified() => {
            info!("stop requested, flushing replies");
            connection.close().await;
            if tokio::time::timeout(EXIT_GRACE, connection.closed()).await.is_err() {
                debug!("agent did not close its end in time");
            }
        }
        _ = connection.closed() => {
            info!("connection to agent lost");
        }
    }

    let executors: Vec<_> = state.executors.lock().await.drain().map(|(_, e)| e).collect();
    for executor in executors {
        executor.request_shutdown().await;
    }
    info!("executor process exiting");
}
