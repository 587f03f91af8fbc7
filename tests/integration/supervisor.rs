//! Process supervision with real child processes.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use aio_supervisor::multiprocess::pid_is_alive;
use aio_supervisor::{AioManager, ProcessState, ProgramKind, StopOutcome};

use crate::fixture::TestEnv;

/// Place a shell script where the node's executable is expected.
fn install_fake_node(env: &mut TestEnv, script: &str) -> PathBuf {
    env.registry.node.stop_timeout = Duration::from_millis(500);

    let dir = env.registry.install_root().join("blocknet-4.4.1");
    let executable = dir.join(&env.registry.node.executable);
    std::fs::create_dir_all(executable.parent().unwrap()).unwrap();
    std::fs::write(&executable, format!("#!/bin/sh\n{}\n", script)).unwrap();
    std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();
    executable
}

async fn stop(manager: &AioManager) -> StopOutcome {
    tokio::time::timeout(Duration::from_secs(20), manager.stop(ProgramKind::Node))
        .await
        .expect("stop timed out")
        .expect("stop failed")
}

#[tokio::test]
async fn test_start_then_graceful_stop() {
    let mut env = TestEnv::new().await;
    install_fake_node(&mut env, "exec sleep 30");
    let manager = env.manager();
    assert!(manager.status(ProgramKind::Node).installed);

    let pid = manager.start(ProgramKind::Node).await.unwrap();
    assert!(pid_is_alive(pid));
    let status = manager.status(ProgramKind::Node);
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.pids, vec![pid]);

    assert_eq!(stop(&manager).await, StopOutcome::Graceful);
    assert!(!pid_is_alive(pid));
    assert_eq!(manager.status(ProgramKind::Node).state, ProcessState::NotRunning);
}

#[tokio::test]
async fn test_stubborn_process_is_killed_once() {
    let mut env = TestEnv::new().await;
    install_fake_node(&mut env, "trap '' TERM\nwhile true; do sleep 1; done");
    let manager = env.manager();

    let pid = manager.start(ProgramKind::Node).await.unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(stop(&manager).await, StopOutcome::Forced);
    assert!(!pid_is_alive(pid));
    assert_eq!(manager.status(ProgramKind::Node).state, ProcessState::NotRunning);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let mut env = TestEnv::new().await;
    install_fake_node(&mut env, "exec sleep 30");
    let manager = env.manager();

    manager.start(ProgramKind::Node).await.unwrap();
    assert!(manager.start(ProgramKind::Node).await.is_err());
    stop(&manager).await;
}

#[tokio::test]
async fn test_discovered_process_is_stopped() {
    let env = TestEnv::new().await;
    let manager = env.manager();

    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    manager.update_discovered_pids(ProgramKind::Node, vec![pid]);
    assert!(manager.status(ProgramKind::Node).running);

    let outcome = stop(&manager).await;
    assert_ne!(outcome, StopOutcome::AlreadyExited);
    let _ = child.wait();
    assert!(!manager.status(ProgramKind::Node).running);
    assert!(manager.status(ProgramKind::Node).pids.is_empty());
}

#[tokio::test]
async fn test_exited_child_is_reaped_by_scan() {
    let mut env = TestEnv::new().await;
    install_fake_node(&mut env, "sleep 1");
    let manager = env.manager();

    manager.start(ProgramKind::Node).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    manager.update_discovered_pids(ProgramKind::Node, Vec::new());
    let status = manager.status(ProgramKind::Node);
    assert_eq!(status.state, ProcessState::NotRunning);
    assert!(status.pids.is_empty());
}

#[tokio::test]
async fn test_pid_file_is_recovered_by_a_new_manager() {
    let mut env = TestEnv::new().await;
    // No exec: the shell keeps the script path on its command line.
    install_fake_node(&mut env, "sleep 30");

    let pid = {
        let manager = env.manager();
        manager.start(ProgramKind::Node).await.unwrap()
    };

    let manager = env.manager();
    let status = manager.status(ProgramKind::Node);
    assert!(status.running);
    assert_eq!(status.pids, vec![pid]);

    stop(&manager).await;
    assert!(!pid_is_alive(pid));
}

#[tokio::test]
async fn test_reused_pid_in_pid_file_is_left_alone() {
    let env = TestEnv::new().await;
    let mut unrelated = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = unrelated.id();

    let pid_file = env
        .registry
        .home
        .join("run")
        .join(format!("{}.pid", ProgramKind::Node));
    std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    std::fs::write(&pid_file, pid.to_string()).unwrap();

    let manager = env.manager();
    let status = manager.status(ProgramKind::Node);
    assert!(!status.running);
    assert!(status.pids.is_empty());

    assert_eq!(stop(&manager).await, StopOutcome::AlreadyExited);
    assert!(pid_is_alive(pid));
    assert!(!pid_file.exists());

    unrelated.kill().unwrap();
    unrelated.wait().unwrap();
}
