use super::Context;
use portree::git;
use portree::status::{build_entries, StatusEntry};

pub async fn run(ctx: &Context, json: bool) -> anyhow::Result<()> {
    let trees = git::list_worktrees(&ctx.cwd)?;
    let store = ctx.store()?;
    let state = store.with_lock(|| store.load()).await?;

    let entries = build_entries(&trees, &ctx.config, &state);

    if json {
        serde_json::to_writer(std::io::stdout(), &entries)?;
        println!();
        return Ok(());
    }

    print_table(&entries);
    Ok(())
}

fn print_table(entries: &[StatusEntry]) {
    let header = ["WORKTREE", "SERVICE", "PORT", "STATUS", "PID"];
    let rows: Vec<[String; 5]> = entries
        .iter()
        .map(|e| {
            [
                e.worktree.clone(),
                e.service.clone(),
                if e.port > 0 {
                    e.port.to_string()
                } else {
                    "—".to_string()
                },
                e.status.to_string(),
                if e.pid > 0 {
                    e.pid.to_string()
                } else {
                    "—".to_string()
                },
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let print_row = |cells: [&str; 5]| {
        let mut line = String::new();
        for (i, (cell, width)) in cells.iter().zip(widths.iter()).enumerate() {
            if i > 0 {
                line.push_str("   ");
            }
            line.push_str(cell);
            line.extend(std::iter::repeat_n(' ', width.saturating_sub(cell.chars().count())));
        }
        println!("{}", line.trim_end());
    };

    print_row(header);
    for row in &rows {
        print_row([&row[0], &row[1], &row[2], &row[3], &row[4]]);
    }
}
