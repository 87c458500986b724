//! Display-agnostic status rows, shared by `portree ls` and the dashboard.

use crate::config::Config;
use crate::git::Worktree;
use crate::process::is_process_running;
use crate::state::{State, Status};
use serde::Serialize;
use std::collections::HashSet;

/// One row of the status table: a (worktree, service) pair with its runtime
/// facts and derived URLs.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub worktree: String,
    pub service: String,
    pub port: u16,
    pub status: Status,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_url: Option<String>,
}

/// Build rows for every non-bare worktree and configured service, followed
/// by rows for orphaned branches (in state but no longer checked out).
///
/// Liveness is re-probed at read time: a recorded `running` entry whose PID
/// is dead renders as stopped, but state itself is not mutated here — the
/// start path reconciles it under the lock.
pub fn build_entries(trees: &[Worktree], config: &Config, state: &State) -> Vec<StatusEntry> {
    let service_names = config.service_names();
    let proxy_running = state.proxy.status == Status::Running && state.proxy.pid > 0;
    let scheme = if state.proxy.https { "https" } else { "http" };

    let mut entries = Vec::new();
    for tree in trees {
        if tree.is_bare {
            continue;
        }
        let slug = tree.slug();

        for name in &service_names {
            let mut entry = StatusEntry {
                worktree: tree.branch.clone(),
                service: name.clone(),
                port: 0,
                status: Status::Stopped,
                pid: 0,
                url: None,
                direct_url: None,
            };

            if let Some(ss) = state.service(&tree.branch, name) {
                entry.port = ss.port;
                if ss.pid > 0 && is_process_running(ss.pid) {
                    entry.status = Status::Running;
                    entry.pid = ss.pid;
                } else {
                    // Either recorded stopped, or recorded running with a
                    // dead PID (stale) — both display as stopped.
                    entry.status = Status::Stopped;
                }
            }

            if proxy_running {
                if let Some(svc) = config.services.get(name) {
                    entry.url = Some(format!("{scheme}://{slug}.localhost:{}", svc.proxy_port));
                }
            }
            if entry.port > 0 {
                entry.direct_url = Some(format!("http://localhost:{}", entry.port));
            }

            entries.push(entry);
        }
    }

    // Orphaned branches: retained in state, worktree gone.
    let active: HashSet<String> = trees
        .iter()
        .filter(|t| !t.is_bare)
        .map(|t| t.branch.clone())
        .collect();
    let mut orphans = crate::state::orphaned_branches(state, &active);
    orphans.sort();
    for branch in orphans {
        for name in &service_names {
            entries.push(StatusEntry {
                worktree: format!("{branch} (orphaned)"),
                service: name.clone(),
                port: state
                    .service(&branch, name)
                    .map(|ss| ss.port)
                    .unwrap_or(0),
                status: Status::Stopped,
                pid: 0,
                url: None,
                direct_url: None,
            });
        }
    }

    entries
}
