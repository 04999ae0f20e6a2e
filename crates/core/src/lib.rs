//! Shared vocabulary of the deployment engine: resource identities and
//! intents, deploy reports, the executor seam between scheduler and worker
//! pool, code install specs and agent configuration.

pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod id;
pub mod install;
pub mod report;
pub mod resource;

pub use config::{AgentConfig, ExecutorMode, IntervalSetting};
pub use error::{CoreError, ExecutorError};
pub use executor::{Executor, ExecutorManager};
pub use handler::{HandlerContext, HandlerError, HandlerRegistry, ResourceHandler};
pub use id::ResourceId;
pub use install::{
    CodeResolver, EnvBlueprint, ExecutorBlueprint, ExecutorId, ModuleInstallSpec, ModuleSource,
    PipConfig, StaticCodeResolver,
};
pub use report::{
    AttributeChange, DependencyStates, DeployReport, DeployResult, DryRunReport, FactsReport,
    HandlerResourceState, LogLevel, LogLine,
};
pub use resource::{DesiredState, ResourceDetails, ResourceIntent};
