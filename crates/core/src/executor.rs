use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::install::{ExecutorId, ModuleInstallSpec};
use crate::report::{DependencyStates, DeployReport, DryRunReport, FactsReport};
use crate::resource::ResourceDetails;

/// Runs deployment code for the resources of one agent.
///
/// The scheduler only ever talks to executors through this trait; whether the
/// code runs in-process or in a child process is up to the [`ExecutorManager`]
/// that handed it out.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Deploy a single resource.
    ///
    /// Handler failures are reported through the returned [`DeployReport`];
    /// an `Err` means the executor itself could not run the deploy.
    async fn execute(
        &self,
        action_id: Uuid,
        resource: &ResourceDetails,
        reason: &str,
        requires: &DependencyStates,
    ) -> Result<DeployReport, ExecutorError>;

    async fn dry_run(
        &self,
        resources: &[ResourceDetails],
        dry_run_id: Uuid,
    ) -> Result<Vec<DryRunReport>, ExecutorError>;

    async fn get_facts(&self, resource: &ResourceDetails) -> Result<FactsReport, ExecutorError>;

    /// Announce that deploys for `version` are about to start.
    async fn open_version(&self, _version: u64) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn close_version(&self, _version: u64) -> Result<(), ExecutorError> {
        Ok(())
    }
}

#[async_trait]
impl<T: Executor + ?Sized> Executor for Arc<T> {
    async fn execute(
        &self,
        action_id: Uuid,
        resource: &ResourceDetails,
        reason: &str,
        requires: &DependencyStates,
    ) -> Result<DeployReport, ExecutorError> {
        (**self).execute(action_id, resource, reason, requires).await
    }

    async fn dry_run(
        &self,
        resources: &[ResourceDetails],
        dry_run_id: Uuid,
    ) -> Result<Vec<DryRunReport>, ExecutorError> {
        (**self).dry_run(resources, dry_run_id).await
    }

    async fn get_facts(&self, resource: &ResourceDetails) -> Result<FactsReport, ExecutorError> {
        (**self).get_facts(resource).await
    }

    async fn open_version(&self, version: u64) -> Result<(), ExecutorError> {
        (**self).open_version(version).await
    }

    async fn close_version(&self, version: u64) -> Result<(), ExecutorError> {
        (**self).close_version(version).await
    }
}

/// Hands out executors for an agent and a set of code modules.
#[async_trait]
pub trait ExecutorManager: Send + Sync {
    /// Return a live executor whose installed code satisfies `code`,
    /// creating one when needed.
    async fn get_executor(
        &self,
        agent_name: &str,
        agent_uri: &str,
        code: &[ModuleInstallSpec],
    ) -> Result<Arc<dyn Executor>, ExecutorError>;

    /// Stop every executor of one agent and return the ones stopped.
    async fn stop_for_agent(&self, agent_name: &str) -> Vec<ExecutorId>;

    /// Stop every executor this manager owns.
    async fn stop_all(&self);
}

#[async_trait]
impl<T: ExecutorManager + ?Sized> ExecutorManager for Arc<T> {
    async fn get_executor(
        &self,
        agent_name: &str,
        agent_uri: &str,
        code: &[ModuleInstallSpec],
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        (**self).get_executor(agent_name, agent_uri, code).await
    }

    async fn stop_for_agent(&self, agent_name: &str) -> Vec<ExecutorId> {
        (**self).stop_for_agent(agent_name).await
    }

    async fn stop_all(&self) {
        (**self).stop_all().await
    }
}
