//! Process supervisor tests against real `/bin/sh` subprocesses.
#![cfg(target_os = "linux")]

use std::time::Duration;

use rfidisk_core::supervisor::proc_tree::ProcSnapshot;
use rfidisk_core::{LaunchError, ProcessHandle, ProcessSupervisor, Supervisor, SupervisorConfig};

fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorConfig {
        grace_period: Duration::from_millis(500),
        terminate_command_wait: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
    })
}

/// Poll `is_alive` until it matches `expected` or a few seconds pass.
async fn wait_alive(supervisor: &ProcessSupervisor, handle: &ProcessHandle, expected: bool) -> bool {
    for _ in 0..100 {
        if supervisor.is_alive(handle).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn running_descendants(root: u32) -> Vec<(u32, u64)> {
    ProcSnapshot::capture()
        .descendants_of(root)
        .into_iter()
        .filter(|s| !s.is_zombie())
        .map(|s| (s.pid, s.start_time))
        .collect()
}

#[tokio::test]
async fn launch_and_terminate() {
    let supervisor = supervisor();
    let handle = supervisor.launch("sleep 30").await.unwrap();
    assert!(handle.root_pid > 0);
    assert!(handle.start_time.is_some());
    assert!(supervisor.is_alive(&handle).await);

    supervisor.terminate(&handle, "").await.unwrap();
    assert!(wait_alive(&supervisor, &handle, false).await);
}

#[tokio::test]
async fn terminate_reaches_the_whole_tree() {
    let supervisor = supervisor();
    let handle = supervisor
        .launch("sleep 30 & sleep 31 & wait")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let children = running_descendants(handle.root_pid);
    assert!(children.len() >= 2, "expected background children, got {children:?}");

    supervisor.terminate(&handle, "").await.unwrap();

    let snapshot = ProcSnapshot::capture();
    for (pid, start) in children {
        assert!(!snapshot.is_running(pid, start), "pid {pid} survived");
    }
}

#[tokio::test]
async fn ignored_sigterm_escalates_to_sigkill() {
    let supervisor = supervisor();
    let handle = supervisor.launch("trap '' TERM; sleep 30").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.terminate(&handle, "").await.unwrap();
    assert!(wait_alive(&supervisor, &handle, false).await);
}

#[tokio::test]
async fn orphaned_children_count_as_alive() {
    let supervisor = supervisor();
    // The shell exits at once, leaving the sleep behind in its group.
    let handle = supervisor.launch("sleep 30 &").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(supervisor.is_alive(&handle).await);

    supervisor.terminate(&handle, "").await.unwrap();
    assert!(wait_alive(&supervisor, &handle, false).await);
}

#[tokio::test]
async fn short_lived_command_is_not_alive() {
    let supervisor = supervisor();
    let handle = supervisor.launch("true").await.unwrap();
    assert!(wait_alive(&supervisor, &handle, false).await);
    // Terminating something that already exited is fine.
    supervisor.terminate(&handle, "").await.unwrap();
}

#[tokio::test]
async fn custom_terminate_command_runs_instead_of_signals() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("terminated");

    let supervisor = supervisor();
    let handle = supervisor.launch("sleep 30").await.unwrap();

    supervisor
        .terminate(&handle, &format!("touch '{}'", marker.display()))
        .await
        .unwrap();
    assert!(marker.exists());
    // The launched process was not signalled.
    assert!(supervisor.is_alive(&handle).await);

    supervisor.terminate(&handle, "").await.unwrap();
    assert!(wait_alive(&supervisor, &handle, false).await);
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let supervisor = supervisor();
    assert!(matches!(supervisor.launch("   ").await, Err(LaunchError::EmptyCommand)));
}

#[tokio::test]
async fn unknown_program_is_rejected() {
    let supervisor = supervisor();
    match supervisor.launch("rfidisk-no-such-program --fullscreen").await {
        Err(LaunchError::NotFound(program)) => assert_eq!(program, "rfidisk-no-such-program"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}
