//! Accept loop and per-connection tasks.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use hyper::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::ProxyCore;
use crate::listener::{Inbound, Io, Listener};
use crate::{Error, Result};

/// Pause after a failed `accept` so descriptor exhaustion does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Serves inbound connections through a shared [`ProxyCore`].
#[derive(Clone)]
pub struct ProxyServer {
    core: Arc<ProxyCore>,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("core", &self.core)
            .field("inbound_tls", &self.tls.is_some())
            .finish()
    }
}

impl ProxyServer {
    /// `tls` terminates inbound TLS when set; inbound is plaintext otherwise.
    pub fn new(core: ProxyCore, tls: Option<TlsAcceptor>) -> Self {
        Self {
            core: Arc::new(core),
            tls,
        }
    }

    /// Run the accept loop until `shutdown` is cancelled.
    ///
    /// Each accepted connection runs in its own task; in-flight connections
    /// are not waited for once the loop stops.
    pub async fn serve(self, listener: Listener, shutdown: CancellationToken) -> Result<()> {
        info!(target = %self.core.target(), inbound_tls = self.tls.is_some(), "Proxy serving");

        loop {
            let inbound = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(inbound) => inbound,
                    Err(e) if is_fatal_accept_error(&e) => return Err(Error::Io(e)),
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            let span = match inbound.peer {
                Some(peer) => info_span!("connection", %peer),
                None => info_span!("connection", peer = "unix"),
            };
            let connection = serve_connection(Arc::clone(&self.core), self.tls.clone(), inbound);
            tokio::spawn(connection.instrument(span));
        }
    }
}

async fn serve_connection(core: Arc<ProxyCore>, tls: Option<TlsAcceptor>, inbound: Inbound) {
    debug!("Accepted");
    let peer = inbound.peer;

    let stream: Box<dyn Io> = match tls {
        Some(acceptor) => match acceptor.accept(inbound.stream).await {
            Ok(stream) => Box::new(stream),
            Err(e) => {
                debug!(error = %e, "Inbound TLS handshake failed");
                return;
            }
        },
        None => inbound.stream,
    };

    let service = service_fn(move |request: Request<Incoming>| {
        let core = Arc::clone(&core);
        async move { Ok::<_, Infallible>(core.forward(request, peer).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        if is_connection_closed_error(e.as_ref()) {
            debug!(error = %e, "Client went away");
        } else {
            warn!(error = %e, "Connection failed");
        }
        return;
    }
    debug!("Closed");
}

/// Errors that mean the listening socket itself is unusable.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected
    )
}

fn is_connection_closed_error(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(e);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            );
        }
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                return true;
            }
        }
        source = err.source();
    }
    false
}
