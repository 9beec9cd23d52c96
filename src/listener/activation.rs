//! systemd socket activation.
//!
//! The service manager passes listening sockets starting at fd 3 and
//! announces them through `LISTEN_PID`/`LISTEN_FDS`. Exactly one socket is
//! accepted; it may be a TCP or a Unix stream socket.

use listenfd::ListenFd;
use tokio::net::{TcpListener, UnixListener};

use super::Listener;
use crate::{Error, Result};

/// Take the single listener inherited from the service manager.
pub fn inherited_listener() -> Result<Listener> {
    take_single(&mut ListenFd::from_env())
}

/// Take the only socket held by `fds`, failing unless there is exactly one.
pub fn take_single(fds: &mut ListenFd) -> Result<Listener> {
    ensure_single(fds.len())?;

    let tcp_error = match fds.take_tcp_listener(0) {
        Ok(Some(std_listener)) => {
            std_listener.set_nonblocking(true)?;
            return Ok(Listener::Tcp(TcpListener::from_std(std_listener)?));
        }
        Ok(None) => None,
        Err(e) => Some(e),
    };

    match fds.take_unix_listener(0) {
        Ok(Some(std_listener)) => {
            std_listener.set_nonblocking(true)?;
            Ok(Listener::Unix {
                listener: UnixListener::from_std(std_listener)?,
                owned_path: None,
            })
        }
        Ok(None) => Err(Error::Activation(match tcp_error {
            Some(e) => format!("inherited fd is unusable: {e}"),
            None => "inherited fd was already taken".into(),
        })),
        Err(e) => Err(Error::Activation(format!(
            "inherited fd is neither a TCP nor a Unix stream socket: {e}"
        ))),
    }
}

/// Exactly one inherited socket is supported.
pub fn ensure_single(count: usize) -> Result<()> {
    match count {
        1 => Ok(()),
        0 => Err(Error::Activation(
            "no listeners passed by the service manager (is the .socket unit active?)".into(),
        )),
        n => Err(Error::Activation(format!(
            "unexpected number of socket activation fds: {n} (expected 1)"
        ))),
    }
}
