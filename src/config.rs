//! `.portree.toml` loading and validation.
//!
//! The config file lives at the repository root and declares the services to
//! run in every worktree, global child environment variables, and optional
//! per-branch overrides (command, fixed port, extra env).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const FILE_NAME: &str = ".portree.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub worktrees: BTreeMap<String, WorktreeOverride>,
}

/// A named long-running command with a port range and a proxy port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub command: String,
    /// Working directory relative to the worktree root; empty means the root.
    #[serde(default)]
    pub dir: String,
    pub port_range: PortRange,
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeOverride {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Config {
    /// Read and validate the config file from the given repo root.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(FILE_NAME);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Config(format!(
                    "{} not found in {}; run 'portree init' first",
                    FILE_NAME,
                    repo_root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let cfg: Config =
            toml::from_str(&data).map_err(|source| Error::ConfigParse { path, source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(Error::Config(
                "at least one service must be defined in [services]".to_string(),
            ));
        }

        let mut proxy_ports: BTreeMap<u16, &str> = BTreeMap::new();
        for (name, svc) in &self.services {
            if svc.command.is_empty() {
                return Err(Error::Config(format!(
                    "service {name:?}: command must not be empty"
                )));
            }
            if svc.port_range.min == 0 {
                return Err(Error::Config(format!(
                    "service {name:?}: port_range.min must be positive"
                )));
            }
            if svc.port_range.min > svc.port_range.max {
                return Err(Error::Config(format!(
                    "service {name:?}: port_range.min ({}) must be <= port_range.max ({})",
                    svc.port_range.min, svc.port_range.max
                )));
            }
            if svc.proxy_port == 0 {
                return Err(Error::Config(format!(
                    "service {name:?}: proxy_port must be positive"
                )));
            }
            if let Some(existing) = proxy_ports.insert(svc.proxy_port, name) {
                return Err(Error::Config(format!(
                    "services {existing:?} and {name:?} have the same proxy_port {}",
                    svc.proxy_port
                )));
            }
        }

        for (wt_name, wt) in &self.worktrees {
            for (svc_name, ov) in &wt.services {
                let Some(svc) = self.services.get(svc_name) else {
                    return Err(Error::Config(format!(
                        "worktree {wt_name:?} references unknown service {svc_name:?}"
                    )));
                };
                if let Some(port) = ov.port {
                    if !svc.port_range.contains(port) {
                        return Err(Error::Config(format!(
                            "worktree {wt_name:?} service {svc_name:?} port {port} is outside range [{}, {}]",
                            svc.port_range.min, svc.port_range.max
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Service names in sorted order (BTreeMap iteration is already sorted).
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Command for a service, honoring a per-branch override.
    pub fn command_for_branch(&self, service: &str, branch: &str) -> Option<String> {
        if let Some(ov) = self.service_override(service, branch) {
            if let Some(cmd) = &ov.command {
                if !cmd.is_empty() {
                    return Some(cmd.clone());
                }
            }
        }
        self.services.get(service).map(|s| s.command.clone())
    }

    /// Merged environment for a service: global env with the per-branch
    /// override layered on top (override wins).
    pub fn env_for_branch(&self, service: &str, branch: &str) -> BTreeMap<String, String> {
        let mut merged = self.env.clone();
        if let Some(ov) = self.service_override(service, branch) {
            for (k, v) in &ov.env {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Fixed port override for a branch+service, if configured.
    pub fn fixed_port_for_branch(&self, service: &str, branch: &str) -> Option<u16> {
        self.service_override(service, branch).and_then(|ov| ov.port)
    }

    /// The service whose proxy listener owns the given port. Proxy ports are
    /// validated unique, so at most one service matches.
    pub fn service_for_proxy_port(&self, proxy_port: u16) -> Option<(&str, &ServiceConfig)> {
        self.services
            .iter()
            .find(|(_, svc)| svc.proxy_port == proxy_port)
            .map(|(name, svc)| (name.as_str(), svc))
    }

    fn service_override(&self, service: &str, branch: &str) -> Option<&ServiceOverride> {
        self.worktrees.get(branch)?.services.get(service)
    }
}

const INIT_TEMPLATE: &str = r#"# portree configuration
# Services run per git worktree with automatic port allocation and
# subdomain proxy routing (http://<branch-slug>.localhost:<proxy_port>).

[services.frontend]
command = "pnpm run dev"
dir = "frontend"                        # relative to worktree root (empty = root)
port_range = { min = 3100, max = 3199 } # port allocation range for this service
proxy_port = 3000                       # proxy listens on this port

[services.backend]
command = "source .venv/bin/activate && python manage.py runserver 0.0.0.0:$PORT"
dir = "backend"
port_range = { min = 8100, max = 8199 }
proxy_port = 8000

# --- Global environment variables ---
[env]
# NODE_ENV = "development"

# --- Per-worktree overrides (optional) ---
# [worktrees.main]
# services.frontend.port = 3100       # fixed port
#
# [worktrees."feature/auth"]
# services.backend.command = "python manage.py runserver --settings=myapp.settings_auth 0.0.0.0:$PORT"
# services.backend.env = { DEBUG = "1" }
"#;

/// Create a default `.portree.toml` in the given directory. Refuses to
/// overwrite an existing file.
pub fn init(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(FILE_NAME);
    if path.exists() {
        return Err(Error::Config(format!("{FILE_NAME} already exists")));
    }
    fs::write(&path, INIT_TEMPLATE)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_service(proxy_port: u16) -> ServiceConfig {
        ServiceConfig {
            command: "npm run dev".to_string(),
            dir: String::new(),
            port_range: PortRange {
                min: 3100,
                max: 3199,
            },
            proxy_port,
        }
    }

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.services.insert("web".to_string(), one_service(3000));
        cfg
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_services() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_command() {
        let mut cfg = base_config();
        cfg.services.get_mut("web").unwrap().command = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut cfg = base_config();
        cfg.services.get_mut("web").unwrap().port_range = PortRange { min: 3200, max: 3100 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_proxy_ports() {
        let mut cfg = base_config();
        cfg.services.insert("api".to_string(), one_service(3000));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("same proxy_port"));
    }

    #[test]
    fn validate_rejects_unknown_override_service() {
        let mut cfg = base_config();
        let mut wt = WorktreeOverride::default();
        wt.services
            .insert("nope".to_string(), ServiceOverride::default());
        cfg.worktrees.insert("main".to_string(), wt);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_fixed_port() {
        let mut cfg = base_config();
        let mut wt = WorktreeOverride::default();
        wt.services.insert(
            "web".to_string(),
            ServiceOverride {
                port: Some(9000),
                ..Default::default()
            },
        );
        cfg.worktrees.insert("main".to_string(), wt);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn branch_override_wins_for_command_and_env() {
        let mut cfg = base_config();
        cfg.env.insert("NODE_ENV".to_string(), "development".to_string());
        let mut wt = WorktreeOverride::default();
        wt.services.insert(
            "web".to_string(),
            ServiceOverride {
                command: Some("npm run dev:auth".to_string()),
                port: Some(3150),
                env: BTreeMap::from([("DEBUG".to_string(), "1".to_string())]),
            },
        );
        cfg.worktrees.insert("feature/auth".to_string(), wt);

        assert_eq!(
            cfg.command_for_branch("web", "feature/auth").as_deref(),
            Some("npm run dev:auth")
        );
        assert_eq!(
            cfg.command_for_branch("web", "main").as_deref(),
            Some("npm run dev")
        );
        assert_eq!(cfg.fixed_port_for_branch("web", "feature/auth"), Some(3150));
        assert_eq!(cfg.fixed_port_for_branch("web", "main"), None);

        let env = cfg.env_for_branch("web", "feature/auth");
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("development"));
        assert_eq!(env.get("DEBUG").map(String::as_str), Some("1"));
        assert!(!cfg.env_for_branch("web", "main").contains_key("DEBUG"));
    }

    #[test]
    fn parses_toml_document() {
        let doc = r#"
            [services.web]
            command = "npm run dev"
            port_range = { min = 3100, max = 3199 }
            proxy_port = 3000

            [env]
            NODE_ENV = "development"

            [worktrees."feature/auth"]
            services.web.port = 3105
        "#;
        let cfg: Config = toml::from_str(doc).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.fixed_port_for_branch("web", "feature/auth"), Some(3105));
    }

    #[test]
    fn init_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = init(dir.path()).unwrap();
        let cfg: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        cfg.validate().unwrap();
        assert!(init(dir.path()).is_err());
    }

    #[test]
    fn service_for_proxy_port_lookup() {
        let mut cfg = base_config();
        cfg.services.insert("api".to_string(), one_service(8000));
        assert_eq!(cfg.service_for_proxy_port(8000).unwrap().0, "api");
        assert!(cfg.service_for_proxy_port(9999).is_none());
    }
}
