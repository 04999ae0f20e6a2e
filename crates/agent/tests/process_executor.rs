//! Deploys through real `converge-executor` child processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use converge_agent::{build_scheduler, builtin_registry, executor_manager, wait_idle};
use converge_core::{
    AgentConfig, DependencyStates, DeployResult, DesiredState, Executor, ExecutorManager, ExecutorMode,
    IntervalSetting, ResourceDetails, ResourceId, ResourceIntent,
};
use converge_scheduler::AGENT_URI;
use uuid::Uuid;

fn process_config(dir: &Path) -> AgentConfig {
    AgentConfig {
        deploy_interval: IntervalSetting::Disabled,
        repair_interval: IntervalSetting::Disabled,
        executor_mode: ExecutorMode::Process,
        executor_binary: PathBuf::from(env!("CARGO_BIN_EXE_converge-executor")),
        venv_dir: dir.join("envs"),
        executor_rpc_timeout: 30,
        process_grace_time: 2,
        ..AgentConfig::default()
    }
}

fn file_intent(path: &Path, content: &str) -> ResourceIntent {
    let id = ResourceId::parse(format!("std::File[agent1,path={}]", path.display())).unwrap();
    ResourceIntent::new(id)
        .with_attribute("path", path.display().to_string())
        .with_attribute("content", content)
}

#[tokio::test]
async fn child_process_deploys_and_reports_facts() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out").join("motd");
    let manager = executor_manager(&process_config(dir.path()), builtin_registry());

    let executor = manager.get_executor("agent1", AGENT_URI, &[]).await.unwrap();
    executor.open_version(1).await.unwrap();

    let details = ResourceDetails::from_intent(&file_intent(&target, "from the child"), 1);
    let report = executor
        .execute(Uuid::new_v4(), &details, "test", &DependencyStates::new())
        .await
        .unwrap();
    assert_eq!(report.result(), DeployResult::Deployed);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "from the child");

    let facts = executor.get_facts(&details).await.unwrap();
    assert_eq!(facts.facts["exists"], serde_json::json!(true));

    // same agent and code: the running process is reused
    let again = manager.get_executor("agent1", AGENT_URI, &[]).await.unwrap();
    again.close_version(1).await.unwrap();

    let stopped = manager.stop_for_agent("agent1").await;
    assert_eq!(stopped.len(), 1);
    assert!(executor
        .execute(Uuid::new_v4(), &details, "test", &DependencyStates::new())
        .await
        .is_err());
    manager.stop_all().await;
}

#[tokio::test]
async fn scheduler_runs_a_model_through_executor_processes() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let config = process_config(dir.path());
    let (scheduler, store) = build_scheduler(&config, builtin_registry());
    scheduler.start().await.unwrap();

    let one = file_intent(&first, "1");
    let two = file_intent(&second, "2").requiring(one.id.clone());
    let two_id = two.id.clone();
    scheduler
        .apply_desired_state(DesiredState::new(1, vec![one, two]))
        .await
        .unwrap();
    assert!(wait_idle(&scheduler, Duration::from_secs(30)).await);

    assert_eq!(std::fs::read_to_string(&first).unwrap(), "1");
    assert_eq!(std::fs::read_to_string(&second).unwrap(), "2");
    let actions = store.actions_for(scheduler.environment(), &two_id);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].result, DeployResult::Deployed);
    scheduler.stop().await;
}
