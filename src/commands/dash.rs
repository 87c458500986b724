use super::Context;
use portree::tui;

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.store()?;
    tui::run(ctx.config.clone(), store, ctx.cwd.clone()).await?;
    Ok(())
}
