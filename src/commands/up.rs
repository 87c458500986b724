use super::Context;
use portree::git;

pub async fn run(ctx: &Context, all: bool, service: Option<&str>) -> anyhow::Result<()> {
    ctx.check_service_filter(service)?;

    let store = ctx.store()?;
    let mut manager = ctx.manager(&store);
    let trees = ctx.target_trees(all)?;

    for (slug, branches) in git::detect_slug_collisions(&trees) {
        eprintln!(
            "Warning: branches {branches:?} all map to slug {slug:?}; proxy routing may be ambiguous"
        );
    }

    let mut total_started = 0;
    for tree in &trees {
        if tree.is_bare {
            continue;
        }
        for result in manager.start_services(tree, service).await {
            match result.err {
                Some(err) => {
                    eprintln!("Error starting {}/{}: {err}", result.branch, result.service)
                }
                None => {
                    println!(
                        "Starting {} (port {}) for {} ...",
                        result.service, result.port, result.branch
                    );
                    total_started += 1;
                }
            }
        }
    }

    if total_started > 0 {
        let noun = if total_started == 1 { "service" } else { "services" };
        if all {
            println!("✓ {total_started} {noun} started");
        } else {
            println!("✓ {total_started} {noun} started for {}", trees[0].branch);
        }
    }

    Ok(())
}
