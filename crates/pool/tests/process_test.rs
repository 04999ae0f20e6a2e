//! Executor processes that stop talking to the agent.
//!
//! The "executor" here is a shell script that records its pid, closes its
//! stdout and then hangs, so the agent only sees its connection drop.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use converge_core::{AgentConfig, ExecutorManager};
use converge_pool::{ProcessExecutorManager, RequirementsFileInstaller};

fn hanging_executor(dir: &Path, pids: &Path) -> PathBuf {
    let script = dir.join("hanging-executor.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho $$ >> '{}'\nexec 1>&-\nexec sleep 60\n", pids.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn recorded_pids(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[tokio::test]
async fn disconnected_process_is_killed_after_grace_time() {
    let dir = tempfile::tempdir().unwrap();
    let pids = dir.path().join("pids");
    let config = AgentConfig {
        executor_binary: hanging_executor(dir.path(), &pids),
        venv_dir: dir.path().join("envs"),
        executor_rpc_timeout: 5,
        process_grace_time: 1,
        ..AgentConfig::default()
    };
    let manager = ProcessExecutorManager::with_processes(&config, Arc::new(RequirementsFileInstaller));

    assert!(manager.get_executor("agent1", "local:", &[]).await.is_err());

    let mut spawned = Vec::new();
    for _ in 0..50 {
        spawned = recorded_pids(&pids);
        if !spawned.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!spawned.is_empty(), "the executor process never started");

    // the processes ignore the lost connection, so only the grace-time kill ends them
    let mut survivors = spawned.clone();
    for _ in 0..50 {
        survivors = recorded_pids(&pids).into_iter().filter(|pid| alive(pid)).collect();
        if survivors.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(survivors.is_empty(), "still running: {survivors:?}");
    assert!(manager.executors_for_agent("agent1").is_empty());
    manager.stop_all().await;
}
