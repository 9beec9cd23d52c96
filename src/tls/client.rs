//! Outbound TLS client configuration.
//!
//! [`build_client_config`] produces a template `ClientConfig` without a
//! client certificate. The upstream connector clones it per connection and
//! installs a fresh [`HandshakeResolver`](crate::credential::HandshakeResolver).
//!
//! Session resumption is disabled: a resumed TLS session skips client
//! authentication, so a credential revoked at the provider would otherwise
//! keep working on resumed connections.

use std::sync::Arc;

use rustls::client::Resumption;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use super::{TrustRootSet, crypto_provider};
use crate::Result;

/// How the upstream's server certificate is checked.
#[derive(Debug, Clone)]
pub enum ServerVerification {
    /// Validate against the given trust roots (default).
    Roots(TrustRootSet),
    /// Accept any server certificate. Handshake signatures are still
    /// checked, but the peer is not authenticated. Never the default.
    InsecureSkipVerify,
}

/// Build the outbound client config template.
pub fn build_client_config(verification: &ServerVerification) -> Result<ClientConfig> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut config = match verification {
        ServerVerification::Roots(trust) => {
            debug!(roots = trust.len(), "Upstream certificates validated against trust roots");
            builder
                .with_root_certificates(trust.roots())
                .with_no_client_auth()
        }
        ServerVerification::InsecureSkipVerify => {
            warn!("Upstream server certificate validation is DISABLED (--insecure-skip-verify)");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
                .with_no_client_auth()
        }
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.resumption = Resumption::disabled();
    Ok(config)
}

/// Accepts every server certificate; signatures are still verified so the
/// handshake transcript stays consistent.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
