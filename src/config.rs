//! Validated proxy configuration.
//!
//! Everything the CLI supplies is checked here, before any socket is opened
//! or any credential backend is contacted.

use std::path::PathBuf;

use crate::cli::Cli;
use crate::credential::CredentialReference;
use crate::listener::ListenSpec;
use crate::proxy::ProxyTarget;
use crate::tls::{ServerVerification, TrustRootSet};
use crate::{Error, Result};

/// Inbound TLS certificate and key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTls {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// Proxy configuration resolved from the command line.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Credential presented to the upstream
    pub credential: CredentialReference,
    /// Upstream to forward to
    pub target: ProxyTarget,
    /// Where to accept inbound connections
    pub listen: ListenSpec,
    /// Trusted roots for the upstream; `None` means the system store
    pub cacert: Option<PathBuf>,
    /// Skip upstream server certificate validation
    pub insecure_skip_verify: bool,
    /// Terminate inbound TLS with this pair
    pub inbound_tls: Option<InboundTls>,
}

impl ProxyConfig {
    /// Validate CLI input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] or [`Error::InvalidListenSpec`].
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let credential = CredentialReference::parse(cli.credential.as_str())
            .map_err(|e| Error::Config(e.to_string()))?;
        let target = ProxyTarget::parse(&cli.target)?;
        let listen: ListenSpec = cli.listen.parse()?;

        let inbound_tls = match (&cli.tls_cert, &cli.tls_key) {
            (Some(cert), Some(key)) => Some(InboundTls {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "--tls-cert and --tls-key must be given together".into(),
                ));
            }
        };

        Ok(Self {
            credential,
            target,
            listen,
            cacert: cli.cacert.clone(),
            insecure_skip_verify: cli.insecure_skip_verify,
            inbound_tls,
        })
    }

    /// Load the upstream trust roots, or skip verification when asked to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the CA bundle or system store is unusable.
    pub fn server_verification(&self) -> Result<ServerVerification> {
        if self.insecure_skip_verify {
            if self.cacert.is_some() {
                tracing::warn!("--cacert is ignored with --insecure-skip-verify");
            }
            return Ok(ServerVerification::InsecureSkipVerify);
        }
        TrustRootSet::load(self.cacert.as_deref()).map(ServerVerification::Roots)
    }
}
