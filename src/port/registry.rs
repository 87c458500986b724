//! State-backed port assignments.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::port::allocator;
use crate::state::FileStore;
use std::collections::HashSet;
use std::sync::Arc;

/// Combines the allocator with the store to idempotently assign and release
/// ports. Every operation runs as a single locked read-modify-write, so a
/// port is never handed to a second (branch, service) while still recorded.
#[derive(Debug, Clone)]
pub struct Registry {
    store: Arc<FileStore>,
    config: Arc<Config>,
}

impl Registry {
    pub fn new(store: Arc<FileStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Allocate a port for `branch`/`service`, reusing any existing
    /// assignment unchanged.
    pub async fn assign_port(&self, branch: &str, service: &str) -> Result<u16> {
        let svc = self
            .config
            .services
            .get(service)
            .ok_or_else(|| Error::UnknownService(service.to_string()))?
            .clone();
        let fixed = self.config.fixed_port_for_branch(service, branch);

        self.store
            .with_lock(|| {
                let mut state = self.store.load()?;

                if let Some(existing) = state.port_assignment(branch, service) {
                    return Ok(existing);
                }

                let used: HashSet<u16> = state.port_assignments.values().copied().collect();
                let port = allocator::allocate(branch, service, &svc, fixed, &used)?;

                state.set_port_assignment(branch, service, port);
                self.store.save(&state)?;
                Ok(port)
            })
            .await
    }

    /// The currently assigned port, if any.
    pub async fn get_port(&self, branch: &str, service: &str) -> Result<Option<u16>> {
        self.store
            .with_lock(|| Ok(self.store.load()?.port_assignment(branch, service)))
            .await
    }

    /// Remove the assignment for `branch`/`service`.
    pub async fn release(&self, branch: &str, service: &str) -> Result<()> {
        self.store
            .with_lock(|| {
                let mut state = self.store.load()?;
                state
                    .port_assignments
                    .remove(&crate::state::port_key(branch, service));
                self.store.save(&state)
            })
            .await
    }
}
