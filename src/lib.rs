//! # portree
//!
//! Per-repository, multi-worktree dev-server supervisor. Each (branch,
//! service) pair gets a stable backend port, service processes run as
//! detached process groups tracked through a locked on-disk state file, and
//! a reverse proxy routes `<branch-slug>.localhost:<proxy-port>` requests to
//! the right backend.
//!
//! ## Quick start
//!
//! ```no_run
//! use portree::{config::Config, port::Registry, process::Manager, state::FileStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> portree::error::Result<()> {
//! let repo_root = std::path::Path::new("/path/to/repo");
//! let config = Arc::new(Config::load(repo_root)?);
//! let store = Arc::new(FileStore::new(repo_root.join(".portree"))?);
//! let registry = Registry::new(store.clone(), config.clone());
//! let mut manager = Manager::new(config, store, registry);
//!
//! let tree = portree::git::current_worktree(repo_root)?;
//! for result in manager.start_services(&tree, None).await {
//!     println!("{}/{} -> {:?}", result.branch, result.service, result.port);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Cooperation across invocations happens purely through the advisory file
//! lock owned by [`state::FileStore`]; there are no process-wide mutable
//! globals. Within one invocation, each child process and each proxy
//! listener owns a background task with a completion signal that the stop
//! paths await with a deadline.

pub mod browser;
pub mod config;
pub mod error;
pub mod git;
pub mod port;
pub mod process;
pub mod proxy;
pub mod state;
pub mod status;
pub mod tui;

pub use error::{Error, Result};
