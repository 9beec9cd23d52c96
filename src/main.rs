//! KMS Proxy - mTLS forward proxy with KMS/HSM/TPM-held client credentials

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use kms_proxy::{
    cli::Cli,
    config::ProxyConfig,
    credential::{CredentialProvider, CredentialReference, ProviderRegistry},
    lifecycle,
    proxy::{ProxyCore, ProxyServer},
    setup_tracing,
    tls::{CertIdentity, build_client_config, server::build_acceptor},
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match lifecycle::block_on_detached(runtime, run_proxy(&cli)) {
        Ok(()) => {
            info!("Proxy shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_proxy(cli: &Cli) -> anyhow::Result<()> {
    let config = ProxyConfig::from_cli(cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = %config.target,
        listen = %config.listen,
        backend = config.credential.kind(),
        "Starting KMS proxy"
    );

    let verification = config.server_verification()?;

    let registry = ProviderRegistry::with_default_backends();
    let provider = registry
        .open(&config.credential)
        .with_context(|| format!("Cannot open credential '{}'", config.credential))?;

    probe_credential(Arc::clone(&provider), config.credential.clone()).await?;

    let client_config = build_client_config(&verification)?;
    let acceptor = match &config.inbound_tls {
        Some(inbound) => Some(build_acceptor(&inbound.cert, &inbound.key)?),
        None => None,
    };
    if !config.target.is_tls() {
        warn!(target = %config.target, "Upstream is plain HTTP; the client credential is not used");
    }

    let core = ProxyCore::new(
        config.target.clone(),
        client_config,
        provider,
        config.credential.clone(),
    );
    let listener = config.listen.bind().await?;

    lifecycle::run(ProxyServer::new(core, acceptor), listener).await?;
    Ok(())
}

/// Fetch the certificate chain once so a broken credential fails startup
/// instead of the first request.
async fn probe_credential(
    provider: Arc<dyn CredentialProvider>,
    reference: CredentialReference,
) -> anyhow::Result<()> {
    let chain = tokio::task::spawn_blocking(move || provider.resolve_certificate_chain(&reference))
        .await
        .context("Credential probe panicked")??;

    let leaf = chain.leaf().context("Credential provider returned an empty chain")?;
    let identity = CertIdentity::from_der(leaf)?;
    info!(
        identity = %identity.display_name,
        issuer = identity.issuer.as_deref().unwrap_or("<unknown>"),
        dns_names = ?identity.san_dns_names,
        not_after = %identity.not_after,
        chain_len = chain.len(),
        "Client credential available"
    );
    Ok(())
}
