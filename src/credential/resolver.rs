//! Handshake-time client certificate resolution.
//!
//! rustls asks for the client certificate synchronously from inside its
//! state machine. [`HandshakeResolver`] answers by calling the shared
//! [`CredentialProvider`] with the configured reference, once per handshake,
//! and remembers any failure so the connector can report
//! `CredentialUnavailable` instead of a generic TLS error.
//!
//! Provider calls and signatures may block (hardware, network KMS). On a
//! multi-threaded Tokio runtime they run under
//! [`tokio::task::block_in_place`], so other connections keep being polled.

use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::SubjectPublicKeyInfoDer;
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use super::{CredentialError, CredentialProvider, CredentialReference};

/// Client certificate resolver scoped to one outbound handshake.
#[derive(Debug)]
pub struct HandshakeResolver {
    provider: Arc<dyn CredentialProvider>,
    reference: Arc<CredentialReference>,
    failure: Arc<Mutex<Option<CredentialError>>>,
}

impl HandshakeResolver {
    /// Create a resolver for a single handshake.
    pub fn new(provider: Arc<dyn CredentialProvider>, reference: Arc<CredentialReference>) -> Self {
        Self {
            provider,
            reference,
            failure: Arc::default(),
        }
    }

    /// Take the credential failure recorded during the handshake, if any.
    ///
    /// Covers both the lookup and the signature made with the provider's key.
    pub fn take_failure(&self) -> Option<CredentialError> {
        self.failure.lock().take()
    }

    fn load(&self) -> Result<Arc<CertifiedKey>, CredentialError> {
        let chain = self.provider.resolve_certificate_chain(&self.reference)?;
        if chain.is_empty() {
            return Err(CredentialError::unavailable(
                &self.reference,
                "provider returned an empty certificate chain",
            ));
        }
        let key = self.provider.create_signer(&self.reference)?;
        let key = IsolatedSigningKey {
            inner: key,
            reference: Arc::clone(&self.reference),
            failure: Arc::clone(&self.failure),
        };
        Ok(Arc::new(CertifiedKey::new(chain.into_inner(), Arc::new(key))))
    }
}

impl ResolvesClientCert for HandshakeResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match isolate_blocking(|| self.load()) {
            Ok(certified) => {
                debug!(
                    reference = %self.reference,
                    chain_len = certified.cert.len(),
                    offered_schemes = sigschemes.len(),
                    "Client credential resolved"
                );
                Some(certified)
            }
            Err(e) => {
                warn!(reference = %self.reference, error = %e, "Client credential unavailable");
                *self.failure.lock() = Some(e);
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocking isolation
// ─────────────────────────────────────────────────────────────────────────────

/// Run a potentially blocking provider call without starving the runtime.
fn isolate_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Wraps a provider's signing key so `sign` is isolated like the lookups
/// and a failed signature is recorded against the handshake.
#[derive(Debug)]
struct IsolatedSigningKey {
    inner: Arc<dyn SigningKey>,
    reference: Arc<CredentialReference>,
    failure: Arc<Mutex<Option<CredentialError>>>,
}

impl SigningKey for IsolatedSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        self.inner.choose_scheme(offered).map(|signer| {
            Box::new(IsolatedSigner {
                inner: signer,
                reference: Arc::clone(&self.reference),
                failure: Arc::clone(&self.failure),
            }) as Box<dyn Signer>
        })
    }

    fn public_key(&self) -> Option<SubjectPublicKeyInfoDer<'_>> {
        self.inner.public_key()
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.inner.algorithm()
    }
}

#[derive(Debug)]
struct IsolatedSigner {
    inner: Box<dyn Signer>,
    reference: Arc<CredentialReference>,
    failure: Arc<Mutex<Option<CredentialError>>>,
}

impl Signer for IsolatedSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        isolate_blocking(|| self.inner.sign(message)).inspect_err(|e| {
            warn!(reference = %self.reference, error = %e, "Client credential failed to sign");
            *self.failure.lock() = Some(CredentialError::unavailable(
                &self.reference,
                format!("signing failed: {e}"),
            ));
        })
    }

    fn scheme(&self) -> SignatureScheme {
        self.inner.scheme()
    }
}
