//! sslproxy - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use sslproxy::certificate::{ensure_self_signed, format_fingerprint};
use sslproxy::config::parse_level;
use sslproxy::{
    AcmeAuthority, AcmeClient, Args, CertificateBundle, CertificateMode, CertificateSource,
    ChallengeStore, DirCache, DomainRouter, ManagedAcme, ProxyConfig, ProxyServer, Redirector,
    SelfSignedGenerator, StaticFiles,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(parse_level(&args.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .compact()
        .init();

    info!("Starting sslproxy v{}", env!("CARGO_PKG_VERSION"));

    let settings = args.into_settings()?;

    for (host, target) in settings.mapping.iter() {
        info!("Domain mapping: {} -> {}", host, target);
    }

    let certificates: Arc<dyn CertificateSource> = match &settings.certificates {
        CertificateMode::Files { cert, key } => {
            let bundle = CertificateBundle::load(cert, key)
                .with_context(|| format!("loading {} and {}", cert.display(), key.display()))?;
            info!(
                "Loaded certificate {} (SHA256 Fingerprint: {})",
                cert.display(),
                format_fingerprint(bundle.fingerprint())
            );
            Arc::new(StaticFiles::new(bundle))
        }
        CertificateMode::SelfSigned { cert, key } => {
            let generator = SelfSignedGenerator::new(settings.subject_alt_names());
            let bundle = ensure_self_signed(&generator, cert, key, settings.self_signed_validity)
                .context("self-signed certificate provisioning failed")?;
            Arc::new(StaticFiles::new(bundle))
        }
        CertificateMode::Acme {
            domains,
            cache_dir,
            directory_url,
            email,
        } => {
            info!("Using ACME ({}) for domains: {}", directory_url, domains.join(", "));
            let cache = DirCache::new(cache_dir);
            let authority = Arc::new(AcmeAuthority::new(directory_url.clone(), email.clone(), &cache));
            let client = AcmeClient::new(authority, cache, ChallengeStore::new(), true)?;
            Arc::new(ManagedAcme::new(domains.iter().cloned(), Arc::new(client)))
        }
    };

    let router = DomainRouter::new(settings.mapping);

    if let Some(addr) = settings.redirect_addr {
        let redirector = Arc::new(Redirector::new(addr, router.clone()));
        tokio::spawn(async move {
            if let Err(e) = redirector.run().await {
                error!("HTTP redirect server failed: {}", e);
            }
        });
    }

    let config = ProxyConfig {
        listen_addr: settings.listen_addr,
        backend_timeout: settings.backend_timeout,
    };
    let server = Arc::new(ProxyServer::new(config, router, certificates));

    server.run().await?;

    Ok(())
}
