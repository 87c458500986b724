//! Subdomain reverse proxy: `<branch-slug>.localhost:<proxy-port>` requests
//! are steered to the backend port recorded in shared state.

mod resolver;
mod server;
mod tls;

pub use resolver::{parse_slug_from_host, Resolver};
pub use server::ProxyServer;
pub use tls::{cert_paths, load_server_config};
