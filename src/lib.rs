//! KMS Proxy Library
//!
//! Forward proxy that authenticates to one fixed upstream with mutual TLS,
//! using a client credential held by a pluggable provider (KMS, HSM, TPM or
//! PEM files) instead of a key file the proxy reads itself.
//!
//! # Features
//!
//! - **Per-handshake credentials**: certificate chain and signer are fetched
//!   fresh for every outbound TLS handshake, so rotation needs no restart
//! - **Pluggable backends**: explicit [`ProviderRegistry`](credential::ProviderRegistry),
//!   one cargo feature per backend
//! - **Listeners**: `unix:`, `tcp:` and systemd socket activation
//! - **Streaming**: request and response bodies are never buffered;
//!   protocol upgrades (WebSocket, exec streams) are spliced through
//! - **Optional inbound TLS** termination

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod proxy;
pub mod tls;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::LogFormat;

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn setup_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            subscriber.with(fmt::layer().json()).init();
        }
        LogFormat::Text => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
