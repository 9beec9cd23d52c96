//! Client credential contract.
//!
//! The proxy never reads private keys itself. Every outbound handshake asks
//! a [`CredentialProvider`] for a certificate chain and for a signing
//! capability bound to the configured [`CredentialReference`]. Providers may
//! be backed by anything that can sign: a PEM file, a smartcard, a TPM or a
//! cloud KMS.
//!
//! # Modules
//!
//! - [`registry`]: explicit backend-kind → constructor mapping
//! - [`resolver`]: rustls `ResolvesClientCert` adapter, one per handshake
//! - `softkms`: software backend reading PEM files (feature `softkms`)

pub mod registry;
pub mod resolver;
#[cfg(feature = "softkms")]
pub mod softkms;

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::sign::SigningKey;
use thiserror::Error;

pub use registry::ProviderRegistry;
pub use resolver::HandshakeResolver;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by credential providers and the registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The backend cannot currently produce the credential (device absent,
    /// network failure, revoked reference, unreadable file, ...).
    #[error("credential '{reference}' unavailable: {reason}")]
    Unavailable {
        /// Reference that was requested
        reference: String,
        /// Backend-specific reason
        reason: String,
    },

    /// The reference string is malformed or misses a required attribute.
    #[error("invalid credential reference: {0}")]
    InvalidReference(String),

    /// No backend is registered for the reference's kind.
    #[error("no credential backend registered for kind '{0}'")]
    UnknownBackend(String),
}

impl CredentialError {
    /// Shorthand for [`CredentialError::Unavailable`].
    pub fn unavailable(reference: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential reference
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque name of the credential to use, e.g. `tpmkms:name=mykey`.
///
/// The text before the first `:` selects the backend kind. The remainder is
/// backend-specific; most backends use `;`-separated `key=value` attributes,
/// which [`CredentialReference::attribute`] looks up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialReference {
    raw: String,
    kind_len: usize,
}

impl CredentialReference {
    /// Validate and wrap a reference string.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CredentialError> {
        let raw = raw.into();
        let Some((kind, _)) = raw.split_once(':') else {
            return Err(CredentialError::InvalidReference(format!(
                "expected <kind>:<options>, got '{raw}'"
            )));
        };
        if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(CredentialError::InvalidReference(format!(
                "invalid backend kind in '{raw}'"
            )));
        }
        let kind_len = kind.len();
        Ok(Self { raw, kind_len })
    }

    /// Backend kind, e.g. `softkms` or `pkcs11`.
    pub fn kind(&self) -> &str {
        &self.raw[..self.kind_len]
    }

    /// Everything after the kind separator.
    pub fn options(&self) -> &str {
        &self.raw[self.kind_len + 1..]
    }

    /// Look up a `key=value` attribute in the options.
    ///
    /// A bare key without `=` yields an empty value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.options()
            .split(';')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .find_map(|pair| match pair.split_once('=') {
                Some((key, value)) if key.trim() == name => Some(value.trim()),
                None if pair == name => Some(""),
                _ => None,
            })
    }

    /// The full reference string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CredentialReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for CredentialReference {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate chain
// ─────────────────────────────────────────────────────────────────────────────

/// DER certificates, leaf first, as returned by a provider for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChain(Vec<CertificateDer<'static>>);

impl CertificateChain {
    /// Wrap an ordered list of certificates (leaf first).
    pub fn new(certs: Vec<CertificateDer<'static>>) -> Self {
        Self(certs)
    }

    /// The end-entity certificate, if any.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }

    /// Number of certificates in the chain.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when the provider returned nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unwrap into the certificate list.
    pub fn into_inner(self) -> Vec<CertificateDer<'static>> {
        self.0
    }
}

impl From<Vec<CertificateDer<'static>>> for CertificateChain {
    fn from(certs: Vec<CertificateDer<'static>>) -> Self {
        Self(certs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider contract
// ─────────────────────────────────────────────────────────────────────────────

/// Source of a client TLS identity keyed by a [`CredentialReference`].
///
/// Both operations are invoked on every outbound handshake and may run
/// concurrently from several connections. An implementation guarding an
/// exclusive resource (a single-session smartcard, say) may serialise
/// internally; callers then simply wait.
///
/// The chain and the signer returned for one reference must belong to the
/// same key pair. The proxy does not check this.
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Fetch the current certificate chain, leaf first.
    fn resolve_certificate_chain(
        &self,
        reference: &CredentialReference,
    ) -> Result<CertificateChain, CredentialError>;

    /// Obtain a signing capability for the reference's private key.
    ///
    /// The returned key must never expose raw key material; it is held only
    /// for the duration of one handshake.
    fn create_signer(
        &self,
        reference: &CredentialReference,
    ) -> Result<Arc<dyn SigningKey>, CredentialError>;
}
