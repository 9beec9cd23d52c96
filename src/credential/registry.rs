//! Explicit registry of credential backends.
//!
//! The composing application decides which backends exist by registering a
//! constructor per backend kind. Nothing registers itself; a backend that is
//! not compiled in (cargo feature off) or not registered simply yields
//! [`CredentialError::UnknownBackend`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{CredentialError, CredentialProvider, CredentialReference};

/// Builds a provider handle for one reference.
pub type ProviderConstructor = Box<
    dyn Fn(&CredentialReference) -> Result<Arc<dyn CredentialProvider>, CredentialError>
        + Send
        + Sync,
>;

/// Maps a backend kind (`softkms`, `pkcs11`, ...) to its constructor.
#[derive(Default)]
pub struct ProviderRegistry {
    backends: BTreeMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every backend compiled into this binary.
    #[must_use]
    pub fn with_default_backends() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "softkms")]
        registry.register(super::softkms::KIND, super::softkms::SoftKms::open);
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: &str, constructor: F) -> &mut Self
    where
        F: Fn(&CredentialReference) -> Result<Arc<dyn CredentialProvider>, CredentialError>
            + Send
            + Sync
            + 'static,
    {
        self.backends.insert(kind.to_owned(), Box::new(constructor));
        self
    }

    /// Registered backend kinds, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Open the provider handle for `reference`.
    ///
    /// The handle is meant to be opened once at startup and reused for every
    /// handshake; chains and signers are still fetched per handshake.
    pub fn open(
        &self,
        reference: &CredentialReference,
    ) -> Result<Arc<dyn CredentialProvider>, CredentialError> {
        let constructor = self
            .backends
            .get(reference.kind())
            .ok_or_else(|| CredentialError::UnknownBackend(reference.kind().to_owned()))?;
        debug!(kind = reference.kind(), "Opening credential provider");
        constructor(reference)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}
