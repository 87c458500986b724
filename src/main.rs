mod cli;
mod commands;

use clap::{CommandFactory, Parser};
use cli::{Cli, Commands, ProxyCommands};
use portree::Error as PortreeError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(err) = e.downcast_ref::<PortreeError>() {
            eprintln!("Error: {err}");
            if let Some(suggestion) = err.suggestion() {
                eprintln!("\nHint: {suggestion}");
            }
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    // Commands that don't need the repository or config.
    match &cli.command {
        Commands::Init => return commands::init::run(),
        Commands::Doctor => return commands::doctor::run(),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let ctx = commands::Context::resolve()?;

    match cli.command {
        Commands::Up { all, service } => commands::up::run(&ctx, all, service.as_deref()).await,
        Commands::Down {
            all,
            service,
            prune,
        } => commands::down::run(&ctx, all, service.as_deref(), prune).await,
        Commands::Ls { json } => commands::ls::run(&ctx, json).await,
        Commands::Proxy(ProxyCommands::Start { tls }) => commands::proxy::start(&ctx, tls).await,
        Commands::Proxy(ProxyCommands::Stop) => commands::proxy::stop(&ctx).await,
        Commands::Open { service } => commands::open::run(&ctx, service.as_deref()).await,
        Commands::Dash => commands::dash::run(&ctx).await,
        Commands::Init | Commands::Doctor | Commands::Completions { .. } => unreachable!(),
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if quiet {
        "error"
    } else if verbose {
        "portree=debug"
    } else {
        "portree=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
