//! Process lifecycle: serve until a termination signal, then stop.
//!
//! Shutdown cancels the accept loop and returns. Connections already being
//! served are not drained; they end when the process exits. A provider call
//! stuck in hardware or on the network does not hold up exit either; see
//! [`block_on_detached`].

use std::future::Future;
use std::io;
use std::path::Path;

use tokio::runtime::Runtime;
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::listener::Listener;
use crate::proxy::ProxyServer;
use crate::{Error, Result};

/// Drive `future` to completion on `runtime`, then shut the runtime down
/// without waiting for its blocking threads.
///
/// Provider calls run on threads taken out of the worker pool; a call that
/// never returns would otherwise keep the process alive after shutdown.
pub fn block_on_detached<F: Future>(runtime: Runtime, future: F) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    output
}

/// Serve `listener` until SIGINT or SIGTERM.
pub async fn run(server: ProxyServer, listener: Listener) -> Result<()> {
    run_until(server, listener, termination_signal()).await
}

/// Serve `listener` until `shutdown` resolves or the accept loop fails.
///
/// A Unix socket file created by the listener factory is removed before
/// returning, on both paths.
pub async fn run_until<F>(server: ProxyServer, listener: Listener, shutdown: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let socket_path = listener.owned_socket_path().map(Path::to_path_buf);
    let token = CancellationToken::new();
    let mut serve = tokio::spawn(server.serve(listener, token.clone()));

    let outcome = tokio::select! {
        signalled = shutdown => {
            token.cancel();
            let served = joined(serve.await);
            signalled.map_err(Error::Io).and(served)
        }
        finished = &mut serve => joined(finished),
    };

    if let Some(path) = socket_path {
        remove_socket_file(&path);
    }
    outcome
}

fn joined(result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    result.map_err(|e| Error::Io(io::Error::other(format!("accept loop panicked: {e}"))))?
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed unix socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove unix socket"),
    }
}

async fn termination_signal() -> io::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        interrupted = signal::ctrl_c() => {
            interrupted?;
            info!(signal = "SIGINT", "Shutdown signal received");
        }
        () = terminate => {
            info!(signal = "SIGTERM", "Shutdown signal received");
        }
    }
    Ok(())
}
