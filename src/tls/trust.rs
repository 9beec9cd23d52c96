//! Trust root set used to validate the upstream's server certificate.

use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Immutable set of CA certificates, loaded once and shared by every
/// outbound handshake.
#[derive(Debug, Clone)]
pub struct TrustRootSet {
    roots: Arc<RootCertStore>,
}

impl TrustRootSet {
    /// Load from an explicit PEM bundle, or the system trust store when
    /// `cacert` is `None`.
    pub fn load(cacert: Option<&Path>) -> Result<Self> {
        match cacert {
            Some(path) => Self::from_pem_file(path),
            None => Self::system(),
        }
    }

    /// Load the platform's native trust store.
    ///
    /// Individual unreadable certificates are skipped; an empty result is an
    /// error.
    pub fn system() -> Result<Self> {
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            debug!(error = %err, "Skipping unreadable system certificate");
        }

        let mut store = RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(native.certs);
        debug!(added, ignored, "Loaded system CA certificates");

        if store.is_empty() {
            return Err(Error::Config(
                "Unable to load system certificates: no usable roots found".into(),
            ));
        }
        Ok(Self {
            roots: Arc::new(store),
        })
    }

    /// Load every certificate of a PEM bundle.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let certs = super::load_certs(path).map_err(|e| {
            Error::Config(format!("Failed to load cacert at {}: {e}", path.display()))
        })?;
        Self::from_certificates(certs)
    }

    /// Build from DER certificates. Certificates that are not valid trust
    /// anchors are skipped with a warning; at least one must be usable.
    pub fn from_certificates(
        certs: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Result<Self> {
        let mut store = RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(certs);
        if ignored > 0 {
            warn!(ignored, "Ignored CA certificates that could not be parsed");
        }
        if added == 0 {
            return Err(Error::Config("CA bundle contains no usable certificates".into()));
        }
        Ok(Self {
            roots: Arc::new(store),
        })
    }

    /// Shared root store for rustls.
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// Number of trust anchors.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Always `false` for a successfully loaded set.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
