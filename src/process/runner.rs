//! Single-child process runner.
//!
//! Children are spawned as their own process group with stdout/stderr bound
//! to an append-only log file, and are intentionally detached: they survive
//! CLI exit so dev servers keep running after `portree up` returns. Stopping
//! is an explicit action (`portree down`) that signals the whole group.

use crate::error::{Error, Result};
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const STALE_POLL: Duration = Duration::from_millis(100);
const KILL_POLL: Duration = Duration::from_millis(50);

/// Everything needed to start one service process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub service: String,
    pub branch: String,
    pub slug: String,
    /// Shell command, run as `sh -c <command>`.
    pub command: String,
    /// Absolute working directory.
    pub dir: PathBuf,
    /// Assigned backend port, injected as `PORT`.
    pub port: u16,
    /// Merged user environment (global plus per-worktree override).
    pub env: BTreeMap<String, String>,
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// service name -> assigned backend port, for `PT_<NAME>_PORT`.
    pub service_ports: BTreeMap<String, u16>,
    /// service name -> proxy port, for `PT_<NAME>_URL`.
    pub proxy_ports: BTreeMap<String, u16>,
    /// `http` or `https` for the URL vars.
    pub proxy_scheme: String,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
}

/// Manages one child process group.
///
/// State machine: unstarted -> running -> exited. [`Runner::stop`] is valid
/// and idempotent in every state.
#[derive(Debug)]
pub struct Runner {
    config: RunnerConfig,
    pid: Option<u32>,
    done: Option<oneshot::Receiver<()>>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            pid: None,
            done: None,
        }
    }

    /// Launch the process. Returns the child PID.
    pub async fn start(&mut self) -> Result<u32> {
        if let Some(pid) = self.pid {
            if is_process_running(pid) {
                return Err(Error::AlreadyRunning {
                    service: self.config.service.clone(),
                    pid,
                });
            }
        }

        create_log_dir(&self.config.log_dir)?;
        let log_path = self.log_path();
        let log = open_log(&log_path)?;
        let log_err = log.try_clone().map_err(|source| Error::Spawn {
            service: self.config.service.clone(),
            source,
        })?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.command)
            .current_dir(&self.config.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            // New process group so signals reach all descendants atomically.
            .process_group(0)
            .kill_on_drop(false);
        for (key, value) in self.build_env() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            service: self.config.service.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| Error::Spawn {
            service: self.config.service.clone(),
            source: std::io::Error::other("child exited before its pid could be read"),
        })?;

        // A single background wait owns the child; there must never be two
        // concurrent waits on the same process. Stop observes exit through
        // the completion channel.
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = done_tx.send(());
        });

        self.pid = Some(pid);
        self.done = Some(done_rx);
        Ok(pid)
    }

    /// Send SIGTERM to the process group, escalate to SIGKILL after the
    /// grace period. Idempotent; a never-started or already-dead runner is a
    /// no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let Some(raw) = raw_pid(pid) else {
            return Ok(());
        };
        let Ok(pgid) = getpgid(Some(raw)) else {
            // Process group already gone.
            self.done = None;
            return Ok(());
        };

        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            tracing::warn!("failed to send SIGTERM to process group {pgid}: {e}");
        }

        let exited = match self.done.take() {
            Some(done) => tokio::time::timeout(self.config.stop_timeout, done)
                .await
                .is_ok(),
            // The completion channel was consumed by an earlier stop; fall
            // back to polling liveness.
            None => poll_until_dead(pid, self.config.stop_timeout, STALE_POLL).await,
        };

        if !exited {
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                tracing::warn!("failed to send SIGKILL to process group {pgid}: {e}");
            }
        }
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some_and(is_process_running)
    }

    pub fn log_path(&self) -> PathBuf {
        self.config
            .log_dir
            .join(format!("{}.{}.log", self.config.slug, self.config.service))
    }

    /// Child environment additions per the supervisor contract: the user's
    /// merged env, then `PORT`, identity vars, cross-service ports, and
    /// proxy URLs. Entries containing NUL bytes are skipped with a warning.
    fn build_env(&self) -> Vec<(String, String)> {
        let cfg = &self.config;
        let mut env = Vec::with_capacity(cfg.env.len() + 4);

        for (key, value) in &cfg.env {
            if key.contains('\0') || value.contains('\0') {
                tracing::warn!("skipping env var {key:?}: contains NUL byte");
                continue;
            }
            env.push((key.clone(), value.clone()));
        }

        env.push(("PORT".to_string(), cfg.port.to_string()));
        env.push(("PT_BRANCH".to_string(), cfg.branch.clone()));
        env.push(("PT_BRANCH_SLUG".to_string(), cfg.slug.clone()));
        env.push(("PT_SERVICE".to_string(), cfg.service.clone()));

        for (name, port) in &cfg.service_ports {
            env.push((
                format!("PT_{}_PORT", name.to_uppercase()),
                port.to_string(),
            ));
        }

        let scheme = if cfg.proxy_scheme.is_empty() {
            "http"
        } else {
            cfg.proxy_scheme.as_str()
        };
        for (name, proxy_port) in &cfg.proxy_ports {
            env.push((
                format!("PT_{}_URL", name.to_uppercase()),
                format!("{scheme}://{}.localhost:{proxy_port}", cfg.slug),
            ));
        }

        env
    }
}

/// Stop a process by PID recovered from persisted state (post-crash
/// cleanup, where no in-process runner handle exists). Same SIGTERM then
/// SIGKILL escalation, with a 3-second liveness poll in between.
pub async fn stop_pid(pid: u32) {
    let Some(raw) = raw_pid(pid) else { return };
    let Ok(pgid) = getpgid(Some(raw)) else {
        return; // already dead
    };

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        tracing::warn!("failed to send SIGTERM to process group {pgid}: {e}");
    }
    if poll_until_dead(pid, Duration::from_secs(3), STALE_POLL).await {
        return;
    }

    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::warn!("failed to send SIGKILL to process group {pgid}: {e}");
    }
    poll_until_dead(pid, KILL_POLL * 5, KILL_POLL).await;
}

/// Probe liveness by sending signal 0. A zero PID is never running.
pub fn is_process_running(pid: u32) -> bool {
    let Some(raw) = raw_pid(pid) else { return false };
    signal::kill(raw, None).is_ok()
}

async fn poll_until_dead(pid: u32, total: Duration, tick: Duration) -> bool {
    let rounds = (total.as_millis() / tick.as_millis().max(1)).max(1);
    for _ in 0..rounds {
        tokio::time::sleep(tick).await;
        if !is_process_running(pid) {
            return true;
        }
    }
    !is_process_running(pid)
}

fn raw_pid(pid: u32) -> Option<Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(Pid::from_raw(pid as i32))
}

fn create_log_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    Ok(opts.open(path)?)
}
