use super::Context;
use portree::git;
use std::collections::HashSet;

pub async fn run(ctx: &Context, all: bool, service: Option<&str>, prune: bool) -> anyhow::Result<()> {
    if prune {
        return prune_orphans(ctx).await;
    }

    ctx.check_service_filter(service)?;
    let store = ctx.store()?;
    let mut manager = ctx.manager(&store);
    let trees = ctx.target_trees(all)?;

    let mut total_stopped = 0;
    for tree in &trees {
        if tree.is_bare {
            continue;
        }
        for result in manager.stop_services(tree, service).await {
            match result.err {
                Some(err) => {
                    eprintln!("Error stopping {}/{}: {err}", result.branch, result.service)
                }
                None => {
                    println!("Stopping {} for {} ...", result.service, result.branch);
                    total_stopped += 1;
                }
            }
        }
    }

    if total_stopped > 0 {
        let noun = if total_stopped == 1 { "service" } else { "services" };
        if all {
            println!("✓ {total_stopped} {noun} stopped");
        } else {
            println!("✓ {total_stopped} {noun} stopped for {}", trees[0].branch);
        }
    }

    Ok(())
}

/// Remove state entries for branches whose worktrees no longer exist.
async fn prune_orphans(ctx: &Context) -> anyhow::Result<()> {
    let trees = git::list_worktrees(&ctx.cwd)?;
    let active: HashSet<String> = trees
        .iter()
        .filter(|t| !t.is_bare)
        .map(|t| t.branch.clone())
        .collect();

    let store = ctx.store()?;
    let manager = ctx.manager(&store);
    let pruned = manager.prune(&active).await?;

    if pruned.is_empty() {
        println!("No orphaned state entries found.");
    } else {
        println!(
            "Pruned {} orphaned branch(es): {}",
            pruned.len(),
            pruned.join(", ")
        );
    }
    Ok(())
}
