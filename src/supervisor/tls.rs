//! TLS context built from a PEM certificate chain and private key.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};

use super::error::StartupError;

fn open(path: &Path) -> Result<BufReader<File>, StartupError> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StartupError::TlsMaterialMissing(path.to_path_buf()))
        }
        Err(e) => Err(StartupError::TlsInvalid(format!("{}: {}", path.display(), e))),
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, StartupError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .map_err(|e| StartupError::TlsInvalid(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(StartupError::TlsInvalid(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey, StartupError> {
    let invalid = |e: std::io::Error| StartupError::TlsInvalid(format!("{}: {}", path.display(), e));

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open(path)?).map_err(invalid)?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open(path)?).map_err(invalid)?;
    }
    keys.into_iter().next().map(PrivateKey).ok_or_else(|| {
        StartupError::TlsInvalid(format!("no private key found in {}", path.display()))
    })
}

/// Build the server-side TLS configuration. Any problem is fatal.
pub fn load_tls_config(certfile: &Path, certkey: &Path) -> Result<Arc<ServerConfig>, StartupError> {
    let certs = load_certs(certfile)?;
    let key = load_key(certkey)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| StartupError::TlsInvalid(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
