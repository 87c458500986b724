//! Git worktree discovery.
//!
//! Thin porcelain adapter: repo-root resolution, `git worktree list
//! --porcelain` parsing, and branch-to-slug mapping. All state is shared
//! across sibling worktrees, so the state directory anchors on the *main*
//! worktree root (resolved through the git common dir).

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A single git worktree: a directory bound to one branch of the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub head: String,
    pub is_bare: bool,
}

impl Worktree {
    /// DNS-safe slug for this worktree's branch.
    pub fn slug(&self) -> String {
        branch_slug(&self.branch)
    }
}

/// Map a branch name to a DNS-safe label: every run of non-alphanumeric
/// ASCII collapses to a single `-`, leading/trailing `-` are trimmed, and
/// the result is lowercased. Total but not injective; collisions are
/// detected by [`detect_slug_collisions`].
pub fn branch_slug(branch: &str) -> String {
    let mut slug = String::with_capacity(branch.len());
    let mut pending_dash = false;
    for ch in branch.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Slugs claimed by more than one non-bare worktree, mapped to the branches
/// that claim them. Empty means no collisions.
pub fn detect_slug_collisions(trees: &[Worktree]) -> BTreeMap<String, Vec<String>> {
    let mut by_slug: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for tree in trees {
        if tree.is_bare {
            continue;
        }
        by_slug.entry(tree.slug()).or_default().push(tree.branch.clone());
    }
    by_slug.retain(|_, branches| branches.len() > 1);
    by_slug
}

fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| Error::Git(format!("running git: {e}")))?;
    if !out.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Root of the worktree containing `dir`.
pub fn find_repo_root(dir: &Path) -> Result<PathBuf> {
    git_output(dir, &["rev-parse", "--show-toplevel"])
        .map(PathBuf::from)
        .map_err(|_| Error::NotARepository)
}

/// Root of the *main* worktree, resolved through the git common dir. This is
/// where shared state lives so that every sibling worktree sees the same
/// `.portree/` directory.
pub fn main_worktree_root(dir: &Path) -> Result<PathBuf> {
    let common = git_output(dir, &["rev-parse", "--git-common-dir"])?;
    let mut common = PathBuf::from(common);
    if !common.is_absolute() {
        common = dir.join(common);
    }
    let common = common
        .canonicalize()
        .unwrap_or(common);
    // The common dir is typically <main-root>/.git.
    common
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Git(format!("git common dir {} has no parent", common.display())))
}

/// All worktrees of the repository containing `dir`.
pub fn list_worktrees(dir: &Path) -> Result<Vec<Worktree>> {
    let out = git_output(dir, &["worktree", "list", "--porcelain"])?;
    Ok(parse_porcelain(&out))
}

/// The worktree whose path contains `dir`.
pub fn current_worktree(dir: &Path) -> Result<Worktree> {
    let abs = dir
        .canonicalize()
        .map_err(|e| Error::Git(format!("resolving {}: {e}", dir.display())))?;
    let trees = list_worktrees(dir)?;

    for tree in &trees {
        let tree_path = tree.path.canonicalize().unwrap_or_else(|_| tree.path.clone());
        if tree_path == abs {
            return Ok(tree.clone());
        }
    }
    // Fall back to prefix containment for invocations from a subdirectory.
    for tree in &trees {
        let tree_path = tree.path.canonicalize().unwrap_or_else(|_| tree.path.clone());
        if abs.starts_with(&tree_path) {
            return Ok(tree.clone());
        }
    }
    Err(Error::Git(format!(
        "current directory {} is not a known worktree",
        abs.display()
    )))
}

/// Parse `git worktree list --porcelain` output. Blocks look like:
///
/// ```text
/// worktree /path/to/worktree
/// HEAD <sha>
/// branch refs/heads/<name>
/// <blank>
/// ```
///
/// A `detached` tree takes the first 8 hex chars of HEAD as its label.
fn parse_porcelain(output: &str) -> Vec<Worktree> {
    let mut trees = Vec::new();
    let mut current: Option<Worktree> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(tree) = current.take() {
                trees.push(tree);
            }
            current = Some(Worktree {
                path: PathBuf::from(path),
                branch: String::new(),
                head: String::new(),
                is_bare: false,
            });
            continue;
        }
        let Some(tree) = current.as_mut() else { continue };
        if let Some(head) = line.strip_prefix("HEAD ") {
            tree.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            tree.branch = branch
                .strip_prefix("refs/heads/")
                .unwrap_or(branch)
                .to_string();
        } else if line == "bare" {
            tree.is_bare = true;
        } else if line == "detached" && tree.branch.is_empty() {
            tree.branch = if tree.head.len() >= 8 {
                tree.head[..8].to_string()
            } else {
                tree.head.clone()
            };
        }
    }
    if let Some(tree) = current {
        trees.push(tree);
    }
    trees
}
