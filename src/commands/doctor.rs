use portree::config::{self, Config};
use portree::port::is_port_free;
use portree::process::is_process_running;
use portree::state::{FileStore, Status};
use portree::git;
use std::path::Path;
use std::process::Command;

struct CheckResult {
    name: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Run environment checks. Never fails; problems are printed, not returned.
pub fn run() -> anyhow::Result<()> {
    let mut results = vec![check_git()];

    let cwd = std::env::current_dir()?;
    match git::find_repo_root(&cwd) {
        Ok(root) => {
            results.push(CheckResult::ok(
                "inside git repository",
                root.display().to_string(),
            ));
            results.push(check_config(&root));
            if let Ok(cfg) = Config::load(&root) {
                results.extend(check_proxy_ports(&cfg));
                let state_root = git::main_worktree_root(&cwd).unwrap_or(root);
                results.push(check_stale_state(&state_root));
            }
        }
        Err(_) => {
            results.push(CheckResult::fail(
                "inside git repository",
                "not inside a git repository",
            ));
        }
    }

    print_results(&results);
    Ok(())
}

fn print_results(results: &[CheckResult]) {
    let mut all_ok = true;
    for r in results {
        let mark = if r.ok { "✓" } else { "✗" };
        all_ok &= r.ok;
        println!("  {mark}  {}", r.name);
        if !r.detail.is_empty() {
            println!("     {}", r.detail);
        }
    }
    if all_ok {
        println!("\nAll checks passed.");
    } else {
        println!("\nSome checks failed. See details above.");
    }
}

fn check_git() -> CheckResult {
    match Command::new("git").arg("--version").output() {
        Ok(out) if out.status.success() => CheckResult::ok(
            "git installed",
            String::from_utf8_lossy(&out.stdout).trim().to_string(),
        ),
        Ok(_) => CheckResult::fail("git installed", "git found but failed to run"),
        Err(_) => CheckResult::fail("git installed", "git not found in PATH"),
    }
}

fn check_config(root: &Path) -> CheckResult {
    if !root.join(config::FILE_NAME).exists() {
        return CheckResult::fail(
            "config file",
            format!("{} not found (run 'portree init' to create)", config::FILE_NAME),
        );
    }
    match Config::load(root) {
        Ok(cfg) => CheckResult::ok(
            "config file",
            format!("{} service(s) defined", cfg.services.len()),
        ),
        Err(e) => CheckResult::fail("config file", e.to_string()),
    }
}

fn check_proxy_ports(cfg: &Config) -> Vec<CheckResult> {
    cfg.services
        .iter()
        .map(|(name, svc)| {
            let check_name = format!("proxy port {} ({name}) available", svc.proxy_port);
            if is_port_free(svc.proxy_port) {
                CheckResult::ok(check_name, "")
            } else {
                // An occupied proxy port is fine when it is our own proxy.
                CheckResult::fail(check_name, format!("port {} already in use", svc.proxy_port))
            }
        })
        .collect()
}

fn check_stale_state(state_root: &Path) -> CheckResult {
    let store = match FileStore::new(state_root.join(".portree")) {
        Ok(store) => store,
        Err(_) => return CheckResult::ok("state file healthy", "no state directory"),
    };
    let state = match store.load() {
        Ok(state) => state,
        Err(e) => return CheckResult::fail("state file healthy", e.to_string()),
    };

    let mut stale = Vec::new();
    for (branch, services) in &state.services {
        for (name, ss) in services {
            if ss.status == Status::Running && ss.pid > 0 && !is_process_running(ss.pid) {
                stale.push(format!("{branch}/{name} (PID {})", ss.pid));
            }
        }
    }

    if stale.is_empty() {
        CheckResult::ok("state file healthy", "")
    } else {
        CheckResult::fail(
            "state file healthy",
            format!("{} stale: {}", stale.len(), stale.join(", ")),
        )
    }
}
