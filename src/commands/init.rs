use portree::{config, git};

pub fn run() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    // Prefer the repo root; fall back to the current directory so init can
    // bootstrap a repo that isn't initialized yet.
    let dir = git::find_repo_root(&cwd).unwrap_or(cwd);
    let path = config::init(&dir)?;
    println!("Created {}", path.display());
    println!("Edit it to declare your services, then run `portree up`.");
    Ok(())
}
