//! Default-browser launching.

use crate::error::Result;
use std::process::{Command, Stdio};

/// Proxy URL for a worktree's service.
pub fn build_url(scheme: &str, slug: &str, proxy_port: u16) -> String {
    format!("{scheme}://{slug}.localhost:{proxy_port}")
}

/// Open the URL in the platform's default browser. The launcher process is
/// detached; its outcome is not awaited.
pub fn open(url: &str) -> Result<()> {
    Command::new(open_command())
        .arg(url)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

fn open_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "rundll32"
    } else {
        "xdg-open"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_shape() {
        assert_eq!(
            build_url("http", "feature-auth", 3000),
            "http://feature-auth.localhost:3000"
        );
        assert_eq!(build_url("https", "main", 8000), "https://main.localhost:8000");
    }
}
