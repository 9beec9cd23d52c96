//! TLS plumbing around the credential contract.
//!
//! # Modules
//!
//! - [`trust`]: trust root set from the system store or a PEM bundle
//! - [`client`]: outbound `rustls::ClientConfig` template
//! - [`server`]: optional inbound TLS termination
//! - [`identity`]: X.509 identity fields for logging
//!
//! All certificate and key files are expected in **PEM format**.

pub mod client;
pub mod identity;
pub mod server;
pub mod trust;

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Error, Result};

pub use client::{ServerVerification, build_client_config};
pub use identity::CertIdentity;
pub use trust::TrustRootSet;

/// The process-wide crypto provider, falling back to `aws-lc-rs`.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Config(format!(
                "Failed to parse certs from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports PKCS#1 (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`) and SEC1
/// (`EC PRIVATE KEY`) blocks.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| {
        Error::Config(format!(
            "Failed to load private key from '{}': {e}",
            path.display()
        ))
    })
}
