use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "portree", version)]
#[command(about = "Per-worktree dev servers with automatic port allocation and subdomain proxy routing")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a default .portree.toml in the repository root
    Init,
    /// Start dev servers for the current worktree
    Up {
        /// Start services for all worktrees
        #[arg(long)]
        all: bool,
        /// Start only a specific service
        #[arg(long)]
        service: Option<String>,
    },
    /// Stop dev servers for the current worktree
    Down {
        /// Stop services for all worktrees
        #[arg(long)]
        all: bool,
        /// Stop only a specific service
        #[arg(long)]
        service: Option<String>,
        /// Remove state entries for deleted worktrees
        #[arg(long)]
        prune: bool,
    },
    /// List all worktrees and their services
    Ls {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Manage the reverse proxy
    #[command(subcommand)]
    Proxy(ProxyCommands),
    /// Open the current worktree's service in a browser
    Open {
        /// Service to open (defaults to the first service alphabetically)
        #[arg(long)]
        service: Option<String>,
    },
    /// Live terminal dashboard of worktrees and services
    Dash,
    /// Check environment and diagnose common issues
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ProxyCommands {
    /// Run the reverse proxy in the foreground
    Start {
        /// Serve TLS using .portree/certs/server.{crt,key}
        #[arg(long)]
        tls: bool,
    },
    /// Stop a running reverse proxy process
    Stop,
}
