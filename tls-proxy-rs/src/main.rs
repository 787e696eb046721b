//! tls-proxy-rs: TLS-terminating reverse proxy
//!
//! Usage: `tls-proxy-rs [config.toml]`

use std::path::PathBuf;
use tls_proxy_rs::{ProxyConfig, ProxyServer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tls_proxy_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tls-proxy-rs v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    match &config_path {
        Some(path) => info!("Loading configuration from {}", path.display()),
        None => info!("No config file specified, using defaults and environment"),
    }
    let config = ProxyConfig::load(config_path.as_deref())?;

    info!(
        backend = %config.backend.url,
        cert_dir = %config.acme.cert_dir.display(),
        hosts = ?config.acme.allowed_hosts,
        "Configuration loaded"
    );

    let server = ProxyServer::from_config(config)?;
    let preloaded = server.manager().preload().await;
    info!(certificates = preloaded, "Certificate cache warmed");

    let listeners = server.bind().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server.serve(listeners, shutdown).await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
