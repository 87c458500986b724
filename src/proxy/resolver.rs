//! Host-to-backend resolution.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::git::branch_slug;
use crate::state::{parse_port_key, FileStore};
use std::sync::Arc;

/// Maps `(slug, listen port)` to the backend port recorded in state.
///
/// Each lookup takes the state lock independently, so a handler sees a
/// consistent snapshot within one request but not across requests.
#[derive(Debug, Clone)]
pub struct Resolver {
    config: Arc<Config>,
    store: Arc<FileStore>,
}

impl Resolver {
    pub fn new(config: Arc<Config>, store: Arc<FileStore>) -> Self {
        Self { config, store }
    }

    /// The backend port for a slug arriving on a proxy listener port.
    pub async fn resolve(&self, slug: &str, listen_port: u16) -> Result<u16> {
        let (service, _) = self
            .config
            .service_for_proxy_port(listen_port)
            .ok_or(Error::UnknownProxyPort(listen_port))?;
        let service = service.to_string();

        let branch = self.slug_to_branch(slug).await?;

        let port = self
            .store
            .with_lock(|| Ok(self.store.load()?.port_assignment(&branch, &service)))
            .await?;

        match port {
            Some(port) if port > 0 => Ok(port),
            _ => Err(Error::NoBackend {
                branch,
                service,
                slug: slug.to_string(),
            }),
        }
    }

    /// Distinct slugs derivable from current port assignments, sorted.
    /// Orphaned branches are included: a client that saw their slug may
    /// still want the recorded port.
    pub async fn available_slugs(&self) -> Result<Vec<String>> {
        self.store
            .with_lock(|| {
                let state = self.store.load()?;
                let mut slugs: Vec<String> = state
                    .port_assignments
                    .keys()
                    .filter_map(|key| {
                        let (branch, service) = parse_port_key(key);
                        (!service.is_empty()).then(|| branch_slug(branch))
                    })
                    .collect();
                slugs.sort();
                slugs.dedup();
                Ok(slugs)
            })
            .await
    }

    /// Translate a slug back to a branch by scanning recorded assignments;
    /// the first matching branch wins (assignments iterate in key order, so
    /// the choice is deterministic even under slug collisions).
    async fn slug_to_branch(&self, slug: &str) -> Result<String> {
        let found = self
            .store
            .with_lock(|| {
                let state = self.store.load()?;
                for key in state.port_assignments.keys() {
                    let (branch, service) = parse_port_key(key);
                    if !service.is_empty() && branch_slug(branch) == slug {
                        return Ok(Some(branch.to_string()));
                    }
                }
                Ok(None)
            })
            .await?;
        found.ok_or_else(|| Error::UnknownSlug(slug.to_string()))
    }
}

/// Extract the slug from a Host header value.
///
/// `"feature-auth.localhost:3000"` -> `Some("feature-auth")`;
/// `"localhost:3000"`, IPs, and non-localhost FQDNs -> `None`.
/// Input is not case-folded; slugs are lowercased at generation time only.
pub fn parse_slug_from_host(host: &str) -> Option<&str> {
    // Strip a trailing :port if present.
    let host = match host.rsplit_once(':') {
        Some((before, _port)) => before,
        None => host,
    };

    let slug = host.strip_suffix(".localhost")?;
    (!slug.is_empty()).then_some(slug)
}
