//! Outbound connections to the upstream.
//!
//! Every forwarded request gets its own TCP connection and, for `https`
//! targets, its own TLS handshake. The shared `ClientConfig` is a template:
//! each handshake runs on a copy carrying a fresh
//! [`HandshakeResolver`], so the credential provider is asked for the chain
//! and signer exactly once per handshake and a failure stays attached to the
//! connection that hit it.

use std::io;
use std::sync::Arc;

use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::ProxyTarget;
use crate::credential::{CredentialProvider, CredentialReference, HandshakeResolver};
use crate::listener::Io;
use crate::{Error, Result};

/// Opens authenticated connections to the fixed upstream.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    target: ProxyTarget,
    tls: Option<Arc<ClientConfig>>,
    provider: Arc<dyn CredentialProvider>,
    reference: Arc<CredentialReference>,
}

impl UpstreamConnector {
    /// `tls` is the client config template; it is ignored for `http` targets.
    pub fn new(
        target: ProxyTarget,
        tls: ClientConfig,
        provider: Arc<dyn CredentialProvider>,
        reference: CredentialReference,
    ) -> Self {
        let tls = target.is_tls().then(|| Arc::new(tls));
        Self {
            target,
            tls,
            provider,
            reference: Arc::new(reference),
        }
    }

    /// The upstream this connector dials.
    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Open a transport to the upstream, completing the TLS handshake for
    /// `https` targets.
    pub async fn connect(&self) -> Result<Box<dyn Io>> {
        let tcp = TcpStream::connect((self.target.host(), self.target.port()))
            .await
            .map_err(|e| {
                Error::UpstreamUnreachable(format!("connect to {}: {e}", self.target.authority()))
            })?;
        tcp.set_nodelay(true)?;

        let Some(template) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let resolver = Arc::new(HandshakeResolver::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.reference),
        ));
        let mut config = ClientConfig::clone(template);
        config.client_auth_cert_resolver = resolver.clone();

        let handshake = TlsConnector::from(Arc::new(config))
            .connect(self.target.server_name()?, tcp)
            .await;

        // Checked even when the handshake succeeded: under TLS 1.3 the
        // server's rejection of an empty certificate arrives after connect.
        if let Some(failure) = resolver.take_failure() {
            return Err(Error::CredentialUnavailable(failure));
        }

        let stream = handshake.map_err(classify_handshake_error)?;
        debug!(upstream = %self.target.authority(), "Upstream TLS handshake complete");
        Ok(Box::new(stream))
    }

    /// Send one request over a new connection and return the response head.
    ///
    /// The connection task keeps running until the response body (or an
    /// upgraded stream) is finished.
    pub async fn send<B>(&self, request: Request<B>) -> Result<Response<Incoming>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = self.connect().await?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::UpstreamUnreachable(format!("HTTP handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(error = %e, "Upstream connection ended with error");
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| Error::UpstreamUnreachable(format!("request failed: {e}")))
    }
}

/// TLS alerts and protocol errors surface as `rustls::Error` wrapped in an
/// `io::Error`; anything else is a transport failure.
fn classify_handshake_error(err: io::Error) -> Error {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => Error::Tls(tls.clone()),
        None => Error::UpstreamUnreachable(format!("TLS handshake: {err}")),
    }
}
