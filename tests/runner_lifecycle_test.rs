//! Process lifecycle: group kills, escalation, and manager recovery across
//! invocations.

use portree::config::{Config, PortRange, ServiceConfig};
use portree::git::Worktree;
use portree::port::Registry;
use portree::process::{is_process_running, Manager, Runner, RunnerConfig};
use portree::state::FileStore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn runner_config(command: &str, dir: &Path) -> RunnerConfig {
    RunnerConfig {
        service: "web".to_string(),
        branch: "main".to_string(),
        slug: "main".to_string(),
        command: command.to_string(),
        dir: dir.to_path_buf(),
        port: 3100,
        env: BTreeMap::new(),
        log_dir: dir.join("logs"),
        service_ports: BTreeMap::new(),
        proxy_ports: BTreeMap::new(),
        proxy_scheme: "http".to_string(),
        stop_timeout: Duration::from_secs(1),
    }
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..50 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if !contents.trim().is_empty() {
                return contents.trim().to_string();
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("file {} never appeared", path.display());
}

/// Stopping must signal the whole process group: a grandchild spawned by
/// the service command dies with it.
#[tokio::test]
async fn stop_kills_descendants_via_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let mut runner = Runner::new(runner_config(&command, dir.path()));
    let shell_pid = runner.start().await.unwrap();

    let child_pid: u32 = wait_for_file(&pid_file).await.parse().unwrap();
    assert!(is_process_running(shell_pid));
    assert!(is_process_running(child_pid));

    runner.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_process_running(shell_pid), "shell survived stop");
    assert!(!is_process_running(child_pid), "grandchild leaked past stop");
}

/// A command that traps SIGTERM forces the SIGKILL escalation path.
#[tokio::test]
async fn sigterm_immune_process_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = runner_config("trap '' TERM; sleep 30", dir.path());
    cfg.stop_timeout = Duration::from_millis(500);
    let mut runner = Runner::new(cfg);

    let pid = runner.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    runner.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_process_running(pid));
}

/// Stop is a no-op in every state: unstarted, stopped, stopped again.
#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = Runner::new(runner_config("sleep 5", dir.path()));
    runner.stop().await.unwrap();

    runner.start().await.unwrap();
    runner.stop().await.unwrap();
    runner.stop().await.unwrap();
    assert!(!runner.is_running());
}

/// A manager in a fresh "invocation" (new instance, empty runner map) stops
/// services recorded by an earlier one, exactly like a post-crash `down`.
#[tokio::test]
async fn fresh_manager_stops_recorded_services() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.services.insert(
        "web".to_string(),
        ServiceConfig {
            command: "sleep 30".to_string(),
            dir: String::new(),
            port_range: PortRange {
                min: 3100,
                max: 3199,
            },
            proxy_port: 3000,
        },
    );
    let config = Arc::new(config);
    let store = Arc::new(FileStore::new(dir.path().join(".portree")).unwrap());
    let tree = Worktree {
        path: dir.path().to_path_buf(),
        branch: "main".to_string(),
        head: String::new(),
        is_bare: false,
    };

    let mut first = Manager::new(
        config.clone(),
        store.clone(),
        Registry::new(store.clone(), config.clone()),
    );
    let results = first.start_services(&tree, None).await;
    let pid = results[0].pid;
    assert!(results[0].err.is_none());
    assert!(is_process_running(pid));
    drop(first);

    let mut second = Manager::new(
        config.clone(),
        store.clone(),
        Registry::new(store.clone(), config),
    );
    let results = second.stop_services(&tree, None).await;
    assert!(results[0].err.is_none());
    assert!(!is_process_running(pid));
}
