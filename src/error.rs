//! Error types for the KMS proxy

use std::io;

use thiserror::Error;

use crate::credential::CredentialError;

/// Result type alias for the KMS proxy
pub type Result<T> = std::result::Result<T, Error>;

/// KMS proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad target URL, unreadable CA bundle, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The `--listen` value could not be parsed
    #[error("Invalid listen spec '{spec}': {reason}")]
    InvalidListenSpec {
        /// The rejected specifier
        spec: String,
        /// Why it was rejected
        reason: String,
    },

    /// A listening socket could not be bound
    #[error("Failed to open listener on {address}: {source}")]
    Bind {
        /// Address that was requested
        address: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// Socket activation did not hand over exactly one listener
    #[error("Socket activation error: {0}")]
    Activation(String),

    /// The credential provider could not supply a certificate or signer
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(#[from] CredentialError),

    /// The upstream could not be reached or dropped the connection
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// TLS negotiation or configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error belongs to the invalid-configuration class,
    /// which is always detected before any socket is opened.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InvalidListenSpec { .. })
    }

    /// Whether this error is scoped to a single connection rather than the
    /// whole process.
    #[must_use]
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            Self::CredentialUnavailable(_) | Self::UpstreamUnreachable(_) | Self::Tls(_)
        )
    }

    pub(crate) fn invalid_listen_spec(spec: &str, reason: impl Into<String>) -> Self {
        Self::InvalidListenSpec {
            spec: spec.to_owned(),
            reason: reason.into(),
        }
    }
}
