//! TLS material loading for the proxy.
//!
//! Certificate issuance is out of scope; the proxy consumes pre-provisioned
//! PEMs from `.portree/certs/`. Anything that can mint a `*.localhost` leaf
//! (mkcert, an internal CA) works.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Expected certificate/key locations under the state directory.
pub fn cert_paths(state_dir: &Path) -> (PathBuf, PathBuf) {
    let certs = state_dir.join("certs");
    (certs.join("server.crt"), certs.join("server.key"))
}

/// Build a rustls server config from PEM files, advertising h2 and http/1.1.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("building server config: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_report_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = cert_paths(dir.path());
        let err = load_server_config(&cert, &key).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn empty_cert_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        let err = load_server_config(&cert, &key).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
