//! TLS material loading.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tracing::debug;

/// Errors raised while building the TLS acceptor.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read TLS file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Build an acceptor from a PEM certificate chain and private key.
///
/// Offers HTTP/2 and HTTP/1.1 over ALPN.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, TlsError> {
    let mut cert_reader = BufReader::new(File::open(cert).map_err(read_error(cert))?);
    let chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error(cert))?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(cert.to_path_buf()));
    }

    let mut key_reader = BufReader::new(File::open(key).map_err(read_error(key))?);
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(read_error(key))?
        .ok_or_else(|| TlsError::NoPrivateKey(key.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(cert = %cert.display(), key = %key.display(), "Loaded TLS material");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_error(path: &Path) -> impl FnOnce(io::Error) -> TlsError {
    let path = path.to_path_buf();
    move |source| TlsError::Read { path, source }
}
