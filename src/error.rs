use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(portree::config::invalid),
        help("Check .portree.toml against `portree init`'s template")
    )]
    Config(String),

    #[error("Git error: {0}")]
    #[diagnostic(
        code(portree::git::error),
        help("Run `portree doctor` to verify git and the repository layout")
    )]
    Git(String),

    #[error("Not inside a git repository")]
    #[diagnostic(
        code(portree::git::no_repo),
        help("portree must be run from within a git worktree")
    )]
    NotARepository,

    #[error("IO error: {0}")]
    #[diagnostic(code(portree::io::error))]
    Io(#[from] io::Error),

    #[error("Parsing {path}: {source}")]
    #[diagnostic(code(portree::config::parse))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("State error: {0}")]
    #[diagnostic(code(portree::state::error))]
    State(String),

    #[error("Timed out acquiring state lock after {0:?}")]
    #[diagnostic(
        code(portree::state::lock_timeout),
        help("Another portree invocation may be stuck; check for hung processes")
    )]
    LockTimeout(Duration),

    #[error("Unknown service {0:?}")]
    #[diagnostic(
        code(portree::service::unknown),
        help("List configured services with `portree ls`")
    )]
    UnknownService(String),

    #[error("Fixed port {port} for {branch}/{service} is already in use")]
    #[diagnostic(
        code(portree::port::fixed_in_use),
        help("Pick a different port in the [worktrees] override or remove it to use hash allocation")
    )]
    FixedPortInUse {
        port: u16,
        branch: String,
        service: String,
    },

    #[error("No available port in range [{min}, {max}] for {branch}/{service}")]
    #[diagnostic(
        code(portree::port::exhausted),
        help("Widen port_range for the service or run `portree down --prune` to release stale assignments")
    )]
    PortRangeExhausted {
        min: u16,
        max: u16,
        branch: String,
        service: String,
    },

    #[error("Service {service} is already running (pid {pid})")]
    #[diagnostic(
        code(portree::process::already_running),
        help("Stop it first with `portree down`")
    )]
    AlreadyRunning { service: String, pid: u32 },

    #[error("Starting {service}: {source}")]
    #[diagnostic(
        code(portree::process::spawn_failed),
        help("Verify the command exists and the working directory is valid")
    )]
    Spawn {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("No service configured for proxy port {0}")]
    #[diagnostic(code(portree::proxy::unknown_port))]
    UnknownProxyPort(u16),

    #[error("No worktree found for slug {0:?}")]
    #[diagnostic(code(portree::proxy::unknown_slug))]
    UnknownSlug(String),

    #[error("No port assigned for {branch}/{service} (slug: {slug})")]
    #[diagnostic(
        code(portree::proxy::no_backend),
        help("Start the service with `portree up` so a port gets assigned")
    )]
    NoBackend {
        branch: String,
        service: String,
        slug: String,
    },

    #[error("Proxy cannot listen on {addr}: {source}")]
    #[diagnostic(
        code(portree::proxy::bind_failed),
        help("Another process may hold the port; `portree doctor` probes all proxy ports")
    )]
    ProxyBind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    #[diagnostic(
        code(portree::proxy::tls),
        help("Place a PEM certificate and key at .portree/certs/server.crt and server.key")
    )]
    Tls(String),
}

impl Error {
    /// Human-readable fix-it hint, surfaced by the binary after the error line.
    pub fn suggestion(&self) -> Option<String> {
        self.help().map(|h| h.to_string())
    }
}
