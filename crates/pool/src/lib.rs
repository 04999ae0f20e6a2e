//! Executor pools.
//!
//! A generic, stackable cache-with-lifecycle ([`PoolManager`]) and the
//! concrete pools built on it: package environments, executor processes,
//! the executors inside them and the in-process executors. The
//! [`IsolatedExecutorManager`] wraps any of them so the scheduler only ever
//! hands out copies of its own data.

pub mod env;
pub mod error;
pub mod executor_manager;
pub mod isolation;
pub mod local;
pub mod manager;
pub mod member;
pub mod process;
pub mod protocol;
pub mod time_based;
pub mod worker;

pub use env::{environment_pool, EnvInstaller, EnvironmentMember, EnvironmentPool, RequirementsFileInstaller};
pub use error::PoolError;
pub use executor_manager::{eviction_candidate, AgentExecutorManager, ManagedExecutor};
pub use isolation::{IsolatedExecutor, IsolatedExecutorManager};
pub use local::{LocalExecutor, LocalExecutorFactory, LocalExecutorManager};
pub use manager::{CreateMember, PoolManager};
pub use member::{MemberLifecycle, PoolMember};
pub use process::{ProcessExecutorManager, ProcessMember, ProcessPool, ProcessSettings, RemoteExecutor};
pub use time_based::{cleanup_idle, TimeBasedPoolManager, MIN_CLEANUP_INTERVAL};
pub use worker::serve_executor;
