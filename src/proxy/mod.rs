//! Mutual-TLS reverse proxy core.
//!
//! Inbound requests (HTTP/1.1 or HTTP/2) are rewritten for the fixed
//! [`ProxyTarget`] and forwarded over HTTP/1.1 on a fresh, client
//! authenticated connection. Bodies stream through without buffering.
//!
//! # Modules
//!
//! - [`target`]: upstream URL and request target rewriting
//! - [`forward`]: hop-by-hop header handling, `Host`, `X-Forwarded-For`
//! - [`upstream`]: per-request connection and TLS handshake
//! - [`server`]: accept loop and per-connection tasks

pub mod forward;
pub mod server;
pub mod target;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tracing::{debug, warn};

use crate::credential::{CredentialProvider, CredentialReference};
use crate::{Error, Result};

pub use server::ProxyServer;
pub use target::ProxyTarget;
pub use upstream::UpstreamConnector;

/// Response body type produced by the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Forwards requests to the upstream. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProxyCore {
    upstream: UpstreamConnector,
}

impl ProxyCore {
    /// Build the core from its validated inputs.
    ///
    /// `client_config` is the outbound template from
    /// [`build_client_config`](crate::tls::build_client_config).
    pub fn new(
        target: ProxyTarget,
        client_config: ClientConfig,
        provider: Arc<dyn CredentialProvider>,
        reference: CredentialReference,
    ) -> Self {
        Self {
            upstream: UpstreamConnector::new(target, client_config, provider, reference),
        }
    }

    /// The upstream this core forwards to.
    pub fn target(&self) -> &ProxyTarget {
        self.upstream.target()
    }

    /// Forward one request. Failures become a `502 Bad Gateway` response;
    /// they never affect other requests.
    pub async fn forward(
        &self,
        request: Request<Incoming>,
        peer: Option<SocketAddr>,
    ) -> Response<ProxyBody> {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        match self.try_forward(request, peer).await {
            Ok(response) => {
                debug!(%method, %path, status = response.status().as_u16(), "Forwarded");
                response
            }
            Err(e) => {
                warn!(%method, %path, error = %e, "Forwarding failed");
                error_response(&e)
            }
        }
    }

    async fn try_forward(
        &self,
        mut request: Request<Incoming>,
        peer: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>> {
        let client_upgrade = forward::upgrade_type(request.headers())
            .is_some()
            .then(|| hyper::upgrade::on(&mut request));

        forward::prepare_request(&mut request, self.target(), peer)?;
        let mut response = self.upstream.send(request).await?;

        forward::prepare_response(&mut response, client_upgrade.is_some());

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(splice(client_upgrade, upstream_upgrade));
            }
        }

        Ok(response.map(BodyExt::boxed))
    }
}

/// Copy bytes both ways between an upgraded client and upstream.
async fn splice(client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "Protocol upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(to_upstream, to_client, "Upgraded stream closed");
        }
        Err(e) => debug!(error = %e, "Upgraded stream ended with error"),
    }
}

/// Plain-text error answer for a request that could not be forwarded.
///
/// The body only names the failure class; paths, references and peer
/// details stay in the log.
pub fn error_response(err: &Error) -> Response<ProxyBody> {
    let (status, reason) = match err {
        Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "proxy misconfigured"),
        Error::CredentialUnavailable(_) => {
            (StatusCode::BAD_GATEWAY, "client credential unavailable")
        }
        Error::Tls(_) => (StatusCode::BAD_GATEWAY, "upstream TLS handshake failed"),
        Error::UpstreamUnreachable(_) => (StatusCode::BAD_GATEWAY, "upstream unreachable"),
        _ => (StatusCode::BAD_GATEWAY, "bad gateway"),
    };
    let mut response = Response::new(full_body(format!("{reason}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}
