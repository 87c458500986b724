//! Persisted runtime state.
//!
//! The whole state is one JSON document (`.portree/state.json`) shared by
//! every portree invocation across every worktree. All mutation flows through
//! [`FileStore::with_lock`], which serializes concurrent invocations with an
//! OS-level advisory lock.

mod store;

pub use store::FileStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Liveness status as persisted on the wire (`"running"` / `"stopped"`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    #[default]
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Running => f.write_str("running"),
            Status::Stopped => f.write_str("stopped"),
        }
    }
}

/// Runtime state of a single service in one worktree.
///
/// Invariants: `status == Running` implies `port > 0 && pid > 0`;
/// `status == Stopped` implies `pid == 0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceState {
    /// A freshly started service, stamped now.
    pub fn running(port: u16, pid: u32) -> Self {
        Self {
            port,
            pid,
            status: Status::Running,
            started_at: Some(Utc::now()),
        }
    }

    /// A stopped service. The last-known port is preserved for display.
    pub fn stopped(port: u16) -> Self {
        Self {
            port,
            pid: 0,
            status: Status::Stopped,
            started_at: None,
        }
    }
}

/// Runtime state of the reverse proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyState {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub status: Status,
    /// Whether the recorded proxy serves TLS; drives URL schemes in `ls`/`open`.
    #[serde(default)]
    pub https: bool,
}

/// The full persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// branch -> service name -> state.
    #[serde(default)]
    pub services: BTreeMap<String, BTreeMap<String, ServiceState>>,
    #[serde(default)]
    pub proxy: ProxyState,
    /// `"branch:service"` -> assigned backend port.
    #[serde(default)]
    pub port_assignments: BTreeMap<String, u16>,
}

impl State {
    pub fn service(&self, branch: &str, service: &str) -> Option<&ServiceState> {
        self.services.get(branch)?.get(service)
    }

    pub fn set_service(&mut self, branch: &str, service: &str, ss: ServiceState) {
        self.services
            .entry(branch.to_string())
            .or_default()
            .insert(service.to_string(), ss);
    }

    /// Assigned port for a branch+service, if any.
    pub fn port_assignment(&self, branch: &str, service: &str) -> Option<u16> {
        self.port_assignments.get(&port_key(branch, service)).copied()
    }

    pub fn set_port_assignment(&mut self, branch: &str, service: &str, port: u16) {
        self.port_assignments.insert(port_key(branch, service), port);
    }
}

/// State key for a branch+service port assignment.
pub fn port_key(branch: &str, service: &str) -> String {
    format!("{branch}:{service}")
}

/// Split a port key back into branch and service. The split is on the
/// *first* `:` so that a service name containing `:` still round-trips the
/// branch; a key with no separator yields an empty service.
pub fn parse_port_key(key: &str) -> (&str, &str) {
    match key.split_once(':') {
        Some((branch, service)) => (branch, service),
        None => (key, ""),
    }
}

/// Branches present in state but absent from the active set.
pub fn orphaned_branches(state: &State, active: &HashSet<String>) -> Vec<String> {
    state
        .services
        .keys()
        .filter(|branch| !active.contains(*branch))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_key_round_trips() {
        assert_eq!(parse_port_key(&port_key("main", "web")), ("main", "web"));
        // Branch names may contain the separator themselves; splitting on the
        // first colon keeps the branch intact only when it has none, but the
        // service side preserves everything after the first.
        assert_eq!(
            parse_port_key("feature/x:web"),
            ("feature/x", "web")
        );
        assert_eq!(parse_port_key("noseparator"), ("noseparator", ""));
        assert_eq!(parse_port_key("a:b:c"), ("a", "b:c"));
    }

    #[test]
    fn running_state_satisfies_invariants() {
        let ss = ServiceState::running(3100, 4242);
        assert_eq!(ss.status, Status::Running);
        assert!(ss.port > 0 && ss.pid > 0);
        assert!(ss.started_at.is_some());
    }

    #[test]
    fn stopped_state_clears_pid_keeps_port() {
        let ss = ServiceState::stopped(3100);
        assert_eq!(ss.status, Status::Stopped);
        assert_eq!(ss.pid, 0);
        assert_eq!(ss.port, 3100);
        assert!(ss.started_at.is_none());
    }

    #[test]
    fn status_wire_format() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"running\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"stopped\"").unwrap(),
            Status::Stopped
        );
    }

    #[test]
    fn orphaned_branches_reports_inactive_only() {
        let mut state = State::default();
        state.set_service("main", "web", ServiceState::stopped(0));
        state.set_service("stale", "web", ServiceState::stopped(0));

        let active = HashSet::from(["main".to_string()]);
        let orphans = orphaned_branches(&state, &active);
        assert_eq!(orphans, vec!["stale".to_string()]);
    }

    #[test]
    fn assignments_by_composite_key() {
        let mut state = State::default();
        state.set_port_assignment("feature/auth", "web", 3150);
        assert_eq!(state.port_assignment("feature/auth", "web"), Some(3150));
        assert_eq!(state.port_assignment("main", "web"), None);
        assert!(state.port_assignments.contains_key("feature/auth:web"));
    }
}
