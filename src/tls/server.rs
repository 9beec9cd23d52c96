//! Optional inbound TLS termination.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{crypto_provider, load_certs, load_private_key};
use crate::{Error, Result};

/// Build an acceptor for inbound TLS from a PEM certificate chain and key.
///
/// Inbound clients are not asked for certificates; the proxy authenticates
/// itself upstream, not its callers.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("Inbound TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(cert = %cert_path.display(), "Inbound TLS enabled");
    Ok(TlsAcceptor::from(Arc::new(config)))
}
