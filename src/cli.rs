//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// mTLS forward proxy whose client credential lives in a KMS, HSM or TPM
#[derive(Parser, Debug)]
#[command(name = "kms-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Credential reference, e.g. `tpmkms:name=client` or
    /// `softkms:cert=client.crt;key=client.key`
    #[arg(env = "KMS_PROXY_CREDENTIAL")]
    pub credential: String,

    /// Upstream URL (http:// or https://)
    #[arg(env = "KMS_PROXY_TARGET")]
    pub target: String,

    /// PEM bundle of trusted roots for the upstream (default: system store)
    #[arg(long, env = "KMS_PROXY_CACERT")]
    pub cacert: Option<PathBuf>,

    /// Listen address: unix:<PATH>, tcp:<HOST>:<PORT> or systemd:
    #[arg(
        short,
        long,
        default_value = "tcp:localhost:8080",
        env = "KMS_PROXY_LISTEN"
    )]
    pub listen: String,

    /// Skip upstream server certificate validation (insecure)
    #[arg(long, env = "KMS_PROXY_INSECURE_SKIP_VERIFY")]
    pub insecure_skip_verify: bool,

    /// Certificate for terminating inbound TLS (requires --tls-key)
    #[arg(long, env = "KMS_PROXY_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Private key for terminating inbound TLS (requires --tls-cert)
    #[arg(long, env = "KMS_PROXY_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KMS_PROXY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "KMS_PROXY_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}
