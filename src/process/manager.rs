//! Fleet coordination across worktrees.

use crate::config::Config;
use crate::error::Result;
use crate::git::Worktree;
use crate::port::Registry;
use crate::process::runner::{
    is_process_running, stop_pid, Runner, RunnerConfig, DEFAULT_STOP_TIMEOUT,
};
use crate::state::{self, FileStore, ServiceState, State, Status};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Outcome of starting or stopping one service.
#[derive(Debug)]
pub struct StartResult {
    pub branch: String,
    pub service: String,
    pub port: u16,
    pub pid: u32,
    pub err: Option<crate::error::Error>,
}

impl StartResult {
    fn ok(branch: &str, service: &str, port: u16, pid: u32) -> Self {
        Self {
            branch: branch.to_string(),
            service: service.to_string(),
            port,
            pid,
            err: None,
        }
    }

    fn failed(branch: &str, service: &str, err: crate::error::Error) -> Self {
        Self {
            branch: branch.to_string(),
            service: service.to_string(),
            port: 0,
            pid: 0,
            err: Some(err),
        }
    }
}

/// Coordinates starting and stopping services across worktrees.
///
/// Live [`Runner`] handles are confined to this instance and keyed by
/// `branch:service`; PIDs recovered from persisted state are handled by
/// [`stop_pid`] when no handle exists.
pub struct Manager {
    config: Arc<Config>,
    store: Arc<FileStore>,
    registry: Registry,
    runners: HashMap<String, Runner>,
}

impl Manager {
    pub fn new(config: Arc<Config>, store: Arc<FileStore>, registry: Registry) -> Self {
        Self {
            config,
            store,
            registry,
            runners: HashMap::new(),
        }
    }

    /// Start services for a worktree. With a filter, only that service; an
    /// unknown filter yields no targets. Results reflect actual outcomes,
    /// one entry per attempted service.
    pub async fn start_services(
        &mut self,
        tree: &Worktree,
        service_filter: Option<&str>,
    ) -> Vec<StartResult> {
        let services = self.target_services(service_filter);
        let branch = tree.branch.as_str();
        let mut results = Vec::with_capacity(services.len());

        // Pre-allocate every port first so cross-service env vars can be
        // injected into each child.
        let mut port_map: BTreeMap<String, u16> = BTreeMap::new();
        for name in &services {
            match self.registry.assign_port(branch, name).await {
                Ok(port) => {
                    port_map.insert(name.clone(), port);
                }
                Err(err) => results.push(StartResult::failed(branch, name, err)),
            }
        }

        let proxy_ports: BTreeMap<String, u16> = self
            .config
            .services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.proxy_port))
            .collect();
        let proxy_scheme = self.proxy_scheme().await;

        let slug = tree.slug();
        let log_dir = self.store.dir().join("logs");

        for name in &services {
            let Some(&port) = port_map.get(name) else {
                continue; // port allocation failed, already reported
            };

            self.clean_stale(branch, name).await;

            let Some(command) = self.config.command_for_branch(name, branch) else {
                continue;
            };
            let svc = &self.config.services[name];
            let dir = if svc.dir.is_empty() {
                tree.path.clone()
            } else {
                tree.path.join(&svc.dir)
            };

            let mut runner = Runner::new(RunnerConfig {
                service: name.clone(),
                branch: branch.to_string(),
                slug: slug.clone(),
                command,
                dir,
                port,
                env: self.config.env_for_branch(name, branch),
                log_dir: log_dir.clone(),
                service_ports: port_map.clone(),
                proxy_ports: proxy_ports.clone(),
                proxy_scheme: proxy_scheme.clone(),
                stop_timeout: DEFAULT_STOP_TIMEOUT,
            });

            match runner.start().await {
                Ok(pid) => {
                    self.runners
                        .insert(state::port_key(branch, name), runner);

                    let save = self
                        .store
                        .with_lock(|| {
                            let mut st = self.store.load()?;
                            st.set_service(branch, name, ServiceState::running(port, pid));
                            self.store.save(&st)
                        })
                        .await;
                    if let Err(e) = save {
                        tracing::warn!("failed to record running state for {branch}/{name}: {e}");
                    }

                    results.push(StartResult::ok(branch, name, port, pid));
                }
                Err(err) => results.push(StartResult::failed(branch, name, err)),
            }
        }

        results
    }

    /// Stop services for a worktree. Prefers the live in-process runner,
    /// falling back to the PID persisted in state; either way the service
    /// is recorded as stopped with its last-known port.
    pub async fn stop_services(
        &mut self,
        tree: &Worktree,
        service_filter: Option<&str>,
    ) -> Vec<StartResult> {
        let services = self.target_services(service_filter);
        let branch = tree.branch.as_str();
        let mut results = Vec::with_capacity(services.len());

        for name in &services {
            let key = state::port_key(branch, name);
            let mut result = StartResult::ok(branch, name, 0, 0);

            if let Some(mut runner) = self.runners.remove(&key) {
                result.pid = runner.pid().unwrap_or(0);
                result.err = runner.stop().await.err();
            } else {
                // Fall back to the PID recorded by a previous invocation.
                let recorded = self
                    .store
                    .with_lock(|| {
                        Ok(self
                            .store
                            .load()?
                            .service(branch, name)
                            .map(|ss| ss.pid))
                    })
                    .await
                    .unwrap_or(None);
                if let Some(pid) = recorded.filter(|&pid| pid > 0 && is_process_running(pid)) {
                    result.pid = pid;
                    stop_pid(pid).await;
                }
            }

            let save = self
                .store
                .with_lock(|| {
                    let mut st = self.store.load()?;
                    let port = st.service(branch, name).map(|ss| ss.port).unwrap_or(0);
                    st.set_service(branch, name, ServiceState::stopped(port));
                    self.store.save(&st)
                })
                .await;
            if let Err(e) = save {
                tracing::warn!("failed to record stopped state for {branch}/{name}: {e}");
            }

            results.push(result);
        }

        results
    }

    /// A locked snapshot of the full state, for display surfaces.
    pub async fn status_all(&self) -> Result<State> {
        self.store.with_lock(|| self.store.load()).await
    }

    /// Remove state entries and port assignments for branches that are no
    /// longer active. Returns the pruned branch names, sorted.
    pub async fn prune(&self, active_branches: &HashSet<String>) -> Result<Vec<String>> {
        self.store
            .with_lock(|| {
                let mut st = self.store.load()?;

                let mut pruned = state::orphaned_branches(&st, active_branches);
                pruned.sort();
                for branch in &pruned {
                    st.services.remove(branch);
                }

                st.port_assignments.retain(|key, _| {
                    let (branch, _) = state::parse_port_key(key);
                    active_branches.contains(branch)
                });

                self.store.save(&st)?;
                Ok(pruned)
            })
            .await
    }

    /// If a recorded running process is dead, transition it to stopped
    /// before a new start is attempted.
    async fn clean_stale(&self, branch: &str, service: &str) {
        let reconcile = self
            .store
            .with_lock(|| {
                let mut st = self.store.load()?;
                if let Some(ss) = st.service(branch, service) {
                    if ss.status == Status::Running
                        && ss.pid > 0
                        && !is_process_running(ss.pid)
                    {
                        tracing::debug!(
                            "reconciling stale state for {branch}/{service} (pid {})",
                            ss.pid
                        );
                        let port = ss.port;
                        st.set_service(branch, service, ServiceState::stopped(port));
                        return self.store.save(&st);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = reconcile {
            tracing::warn!("failed to reconcile stale state for {branch}/{service}: {e}");
        }
    }

    /// Sorted target service names, optionally narrowed to one. An unknown
    /// filter yields an empty list.
    fn target_services(&self, filter: Option<&str>) -> Vec<String> {
        match filter {
            Some(name) if self.config.services.contains_key(name) => vec![name.to_string()],
            Some(_) => Vec::new(),
            None => self.config.service_names(),
        }
    }

    /// URL scheme for child env vars, derived from the recorded proxy state.
    async fn proxy_scheme(&self) -> String {
        let https = self
            .store
            .with_lock(|| Ok(self.store.load()?.proxy.https))
            .await
            .unwrap_or(false);
        if https { "https" } else { "http" }.to_string()
    }
}
