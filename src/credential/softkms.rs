//! Software credential backend.
//!
//! Reference grammar: `softkms:cert=<chain.pem>;key=<key.pem>`.
//!
//! Both files are re-read on every call, so replacing them on disk rotates
//! the credential for the next handshake without restarting the proxy. The
//! private key is handed to the process crypto provider and only the
//! resulting signing capability leaves this module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::SigningKey;

use super::{CertificateChain, CredentialError, CredentialProvider, CredentialReference};
use crate::tls::crypto_provider;

/// Backend kind handled by this module.
pub const KIND: &str = "softkms";

/// PEM-file backed credential provider.
#[derive(Debug, Clone)]
pub struct SoftKms {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl SoftKms {
    /// Provider for an explicit certificate chain file and key file.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Registry constructor: reads the `cert` and `key` attributes.
    pub fn open(
        reference: &CredentialReference,
    ) -> Result<Arc<dyn CredentialProvider>, CredentialError> {
        let attribute = |name: &str| {
            reference
                .attribute(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    CredentialError::InvalidReference(format!(
                        "{reference}: missing '{name}=<path>' attribute"
                    ))
                })
        };
        let provider = Self::new(attribute("cert")?, attribute("key")?);
        Ok(Arc::new(provider))
    }

    /// Path of the PEM certificate chain.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Path of the PEM private key.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

impl CredentialProvider for SoftKms {
    fn resolve_certificate_chain(
        &self,
        reference: &CredentialReference,
    ) -> Result<CertificateChain, CredentialError> {
        let certs = CertificateDer::pem_file_iter(&self.cert_path)
            .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
            .map_err(|e| {
                CredentialError::unavailable(
                    reference,
                    format!("cannot read chain '{}': {e}", self.cert_path.display()),
                )
            })?;
        if certs.is_empty() {
            return Err(CredentialError::unavailable(
                reference,
                format!("no certificates in '{}'", self.cert_path.display()),
            ));
        }
        Ok(CertificateChain::new(certs))
    }

    fn create_signer(
        &self,
        reference: &CredentialReference,
    ) -> Result<Arc<dyn SigningKey>, CredentialError> {
        let key = PrivateKeyDer::from_pem_file(&self.key_path).map_err(|e| {
            CredentialError::unavailable(
                reference,
                format!("cannot read key '{}': {e}", self.key_path.display()),
            )
        })?;
        crypto_provider()
            .key_provider
            .load_private_key(key)
            .map_err(|e| CredentialError::unavailable(reference, format!("unsupported key: {e}")))
    }
}
