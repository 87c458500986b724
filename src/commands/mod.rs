//! Command handlers for the CLI.

pub mod dash;
pub mod doctor;
pub mod down;
pub mod init;
pub mod ls;
pub mod open;
pub mod proxy;
pub mod up;

use portree::config::Config;
use portree::error::Result;
use portree::git;
use portree::port::Registry;
use portree::process::Manager;
use portree::state::FileStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Resolved invocation context for commands that need the repository.
pub struct Context {
    /// Directory the command was invoked from.
    pub cwd: PathBuf,
    /// Root of the current worktree; the config file is read here.
    pub repo_root: PathBuf,
    /// Root of the main worktree; shared state is anchored here so every
    /// sibling worktree sees the same `.portree/`.
    pub state_root: PathBuf,
    pub config: Arc<Config>,
}

impl Context {
    pub fn resolve() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let repo_root = git::find_repo_root(&cwd)?;
        let state_root = git::main_worktree_root(&cwd).unwrap_or_else(|_| repo_root.clone());
        tracing::debug!("repo root: {}", repo_root.display());
        let config = Arc::new(Config::load(&repo_root)?);
        tracing::debug!("loaded config with {} service(s)", config.services.len());
        Ok(Self {
            cwd,
            repo_root,
            state_root,
            config,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_root.join(".portree")
    }

    pub fn store(&self) -> Result<Arc<FileStore>> {
        Ok(Arc::new(FileStore::new(self.state_dir())?))
    }

    pub fn manager(&self, store: &Arc<FileStore>) -> Manager {
        let registry = Registry::new(store.clone(), self.config.clone());
        Manager::new(self.config.clone(), store.clone(), registry)
    }

    /// Validate a `--service` filter against the config.
    pub fn check_service_filter(&self, filter: Option<&str>) -> Result<()> {
        if let Some(name) = filter {
            if !self.config.services.contains_key(name) {
                return Err(portree::Error::UnknownService(name.to_string()));
            }
        }
        Ok(())
    }

    /// Worktrees targeted by `--all` or the current one.
    pub fn target_trees(&self, all: bool) -> Result<Vec<git::Worktree>> {
        if all {
            git::list_worktrees(&self.cwd)
        } else {
            Ok(vec![git::current_worktree(&self.cwd)?])
        }
    }
}
