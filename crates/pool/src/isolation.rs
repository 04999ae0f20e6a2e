//! Copy boundary between the scheduler and executors.
//!
//! Everything handed to an executor is deep-copied first, so deploy code can
//! never observe or alter the scheduler's own resource objects, even when the
//! executor runs in the same process.

use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{
    DependencyStates, DeployReport, DryRunReport, Executor, ExecutorError, ExecutorId, ExecutorManager,
    FactsReport, ModuleInstallSpec, ResourceDetails,
};
use uuid::Uuid;

pub struct IsolatedExecutor {
    delegate: Arc<dyn Executor>,
}

impl IsolatedExecutor {
    pub fn new(delegate: Arc<dyn Executor>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl Executor for IsolatedExecutor {
    async fn execute(
        &self,
        action_id: Uuid,
        resource: &ResourceDetails,
        reason: &str,
        requires: &DependencyStates,
    ) -> Result<DeployReport, ExecutorError> {
        let resource = resource.deep_copy();
        let requires = requires.clone();
        self.delegate.execute(action_id, &resource, reason, &requires).await
    }

    async fn dry_run(
        &self,
        resources: &[ResourceDetails],
        dry_run_id: Uuid,
    ) -> Result<Vec<DryRunReport>, ExecutorError> {
        let resources: Vec<ResourceDetails> = resources.iter().map(ResourceDetails::deep_copy).collect();
        self.delegate.dry_run(&resources, dry_run_id).await
    }

    async fn get_facts(&self, resource: &ResourceDetails) -> Result<FactsReport, ExecutorError> {
        let resource = resource.deep_copy();
        self.delegate.get_facts(&resource).await
    }

    async fn open_version(&self, version: u64) -> Result<(), ExecutorError> {
        self.delegate.open_version(version).await
    }

    async fn close_version(&self, version: u64) -> Result<(), ExecutorError> {
        self.delegate.close_version(version).await
    }
}

/// Wraps every executor another manager hands out in an [`IsolatedExecutor`].
pub struct IsolatedExecutorManager {
    delegate: Arc<dyn ExecutorManager>,
}

impl IsolatedExecutorManager {
    pub fn new(delegate: Arc<dyn ExecutorManager>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl ExecutorManager for IsolatedExecutorManager {
    async fn get_executor(
        &self,
        agent_name: &str,
        agent_uri: &str,
        code: &[ModuleInstallSpec],
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let code = code.to_vec();
        let executor = self.delegate.get_executor(agent_name, agent_uri, &code).await?;
        Ok(Arc::new(IsolatedExecutor::new(executor)))
    }

    async fn stop_for_agent(&self, agent_name: &str) -> Vec<ExecutorId> {
        self.delegate.stop_for_agent(agent_name).await
    }

    async fn stop_all(&self) {
        self.delegate.stop_all().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use converge_core::{DeployResult, HandlerResourceState, ResourceId, ResourceIntent};

    use super::*;

    /// Records the attribute maps it was handed.
    #[derive(Default)]
    struct Capturing {
        seen: Mutex<Vec<ResourceDetails>>,
    }

    #[async_trait]
    impl Executor for Capturing {
        async fn execute(
            &self,
            action_id: Uuid,
            resource: &ResourceDetails,
            _reason: &str,
            requires: &DependencyStates,
        ) -> Result<DeployReport, ExecutorError> {
            assert_eq!(requires.len(), 1);
            self.seen.lock().unwrap().push(resource.clone());
            Ok(DeployReport {
                resource_id: resource.id.clone(),
                action_id,
                state: HandlerResourceState::Deployed,
                changes: Default::default(),
                messages: Vec::new(),
            })
        }

        async fn dry_run(&self, resources: &[ResourceDetails], _id: Uuid) -> Result<Vec<DryRunReport>, ExecutorError> {
            self.seen.lock().unwrap().extend(resources.iter().cloned());
            Ok(Vec::new())
        }

        async fn get_facts(&self, resource: &ResourceDetails) -> Result<FactsReport, ExecutorError> {
            self.seen.lock().unwrap().push(resource.clone());
            Ok(FactsReport {
                resource_id: resource.id.clone(),
                facts: Default::default(),
                messages: Vec::new(),
                success: true,
            })
        }
    }

    fn details() -> ResourceDetails {
        let intent = ResourceIntent::new(ResourceId::parse("test::File[host1,path=/etc/motd]").unwrap())
            .with_attribute("content", "hello");
        ResourceDetails::from_intent(&intent, 1)
    }

    #[tokio::test]
    async fn delegate_never_sees_scheduler_allocation() {
        let inner = Arc::new(Capturing::default());
        let isolated = IsolatedExecutor::new(inner.clone());
        let resource = details();
        let mut requires = DependencyStates::new();
        requires.insert(ResourceId::parse("test::File[host1,path=/a]").unwrap(), DeployResult::Deployed);

        let report = isolated.execute(Uuid::new_v4(), &resource, "test", &requires).await.unwrap();
        assert_eq!(report.state, HandlerResourceState::Deployed);
        isolated.dry_run(std::slice::from_ref(&resource), Uuid::new_v4()).await.unwrap();
        isolated.get_facts(&resource).await.unwrap();

        let seen = inner.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for copy in seen.iter() {
            assert_eq!(copy, &resource);
            assert!(!Arc::ptr_eq(&copy.attributes, &resource.attributes));
        }
    }
}
