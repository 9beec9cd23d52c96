//! Listener factory.
//!
//! Turns a `--listen` specifier into a bound, accepting socket:
//!
//! | Specifier | Result |
//! |---|---|
//! | `unix:<path>` | Unix domain socket bound at `<path>` |
//! | `tcp:<host>:<port>` | TCP listener (`[v6]:port` accepted) |
//! | `systemd:` | the single socket inherited via socket activation |
//!
//! Parsing happens before any bind attempt; binding is never retried.

pub mod activation;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::info;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// ListenSpec
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed `--listen` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    /// `unix:<path>`
    Unix(PathBuf),
    /// `tcp:<host>:<port>`
    Tcp {
        /// Hostname or IP literal, without brackets
        host: String,
        /// Port number
        port: u16,
    },
    /// `systemd:`
    Systemd,
}

impl FromStr for ListenSpec {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        let Some((kind, address)) = spec.split_once(':') else {
            return Err(Error::invalid_listen_spec(
                spec,
                "expected <PROTO>:<ADDR> (unix:<PATH>, tcp:<HOST>:<PORT> or systemd:)",
            ));
        };

        match kind {
            "unix" => {
                if address.is_empty() {
                    return Err(Error::invalid_listen_spec(spec, "missing socket path"));
                }
                Ok(Self::Unix(PathBuf::from(address)))
            }
            "tcp" => parse_tcp(spec, address),
            "systemd" => {
                if !address.is_empty() {
                    return Err(Error::invalid_listen_spec(
                        spec,
                        "systemd: takes no address",
                    ));
                }
                Ok(Self::Systemd)
            }
            other => Err(Error::invalid_listen_spec(
                spec,
                format!("unknown listener kind '{other}'"),
            )),
        }
    }
}

fn parse_tcp(spec: &str, address: &str) -> Result<ListenSpec> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(Error::invalid_listen_spec(spec, "expected tcp:<HOST>:<PORT>"));
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(Error::invalid_listen_spec(spec, "missing host"));
    }
    if host.contains(':') && !address.starts_with('[') {
        return Err(Error::invalid_listen_spec(
            spec,
            "IPv6 hosts must be bracketed, e.g. tcp:[::1]:8080",
        ));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| Error::invalid_listen_spec(spec, format!("invalid port '{port}': {e}")))?;
    Ok(ListenSpec::Tcp {
        host: host.to_owned(),
        port,
    })
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp:[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Systemd => f.write_str("systemd:"),
        }
    }
}

impl ListenSpec {
    /// Bind the socket described by this spec.
    pub async fn bind(&self) -> Result<Listener> {
        let bind_error = |source: io::Error| Error::Bind {
            address: self.to_string(),
            source,
        };

        match self {
            Self::Unix(path) => {
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                info!(path = %path.display(), "Listening to unix socket");
                Ok(Listener::Unix {
                    listener,
                    owned_path: Some(path.clone()),
                })
            }
            Self::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(bind_error)?;
                info!(address = %listener.local_addr().map_err(bind_error)?, "Listening");
                Ok(Listener::Tcp(listener))
            }
            Self::Systemd => {
                let listener = activation::inherited_listener()?;
                info!("Listening on systemd socket activation");
                Ok(listener)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Byte stream of an accepted inbound connection.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// An accepted connection.
pub struct Inbound {
    /// The connection's byte stream.
    pub stream: Box<dyn Io>,
    /// Remote address, for TCP peers.
    pub peer: Option<SocketAddr>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Where a listener is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Unix socket path (`None` for unnamed sockets).
    Unix(Option<PathBuf>),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Self::Unix(None) => f.write_str("unix:<unnamed>"),
        }
    }
}

/// A bound, accepting socket.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener.
    Unix {
        /// The socket.
        listener: UnixListener,
        /// Socket file created by this process, removed on shutdown.
        /// `None` for inherited sockets.
        owned_path: Option<PathBuf>,
    },
}

impl Listener {
    /// Accept the next inbound connection.
    pub async fn accept(&self) -> io::Result<Inbound> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Inbound {
                    stream: Box::new(stream),
                    peer: Some(peer),
                })
            }
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Inbound {
                    stream: Box::new(stream),
                    peer: None,
                })
            }
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(ListenAddr::Tcp),
            Self::Unix { listener, .. } => Ok(ListenAddr::Unix(
                listener.local_addr()?.as_pathname().map(Path::to_path_buf),
            )),
        }
    }

    /// Socket file this process created and should remove on exit.
    pub fn owned_socket_path(&self) -> Option<&Path> {
        match self {
            Self::Unix {
                owned_path: Some(path),
                ..
            } => Some(path),
            _ => None,
        }
    }
}
