use super::Context;
use portree::browser;
use portree::git;
use portree::Error;

pub async fn run(ctx: &Context, service: Option<&str>) -> anyhow::Result<()> {
    let tree = git::current_worktree(&ctx.cwd)?;

    // Default to the first service alphabetically.
    let name = match service {
        Some(name) => name.to_string(),
        None => ctx
            .config
            .service_names()
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("no services configured".to_string()))?,
    };
    let svc = ctx
        .config
        .services
        .get(&name)
        .ok_or_else(|| Error::UnknownService(name.clone()))?;

    let store = ctx.store()?;
    let https = store
        .with_lock(|| Ok(store.load()?.proxy.https))
        .await
        .unwrap_or(false);
    let scheme = if https { "https" } else { "http" };

    let url = browser::build_url(scheme, &tree.slug(), svc.proxy_port);
    println!("Opening {url}");
    browser::open(&url)?;
    Ok(())
}
