mod certs;
mod config_file;
mod config_network;
mod config_source;
mod frontend;
mod metrics;
mod service;
mod tls;

use crate::config_source::{Apply, ConfigSource};
use crate::frontend::{Frontend, FrontendContext};
use crate::metrics::Recorder;
use crate::service::ProxyService;
use anyhow::Context;
use centauri_core::CentauriError;
use centauri_proxy::{RouteManager, Rewriter};
use clap::Parser;
use ipnet::IpNet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CERTIFICATE_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "centauri", version, about = "Multi-tenant TLS-terminating reverse proxy")]
pub struct Cli {
    /// Frontend to listen on
    #[arg(long, env = "FRONTEND", default_value = "tcp")]
    frontend: String,

    /// Where route configuration comes from
    #[arg(long, env = "CONFIG_SOURCE", default_value = "file")]
    config_source: String,

    /// Path to config for the file source
    #[arg(long, env = "CONFIG", default_value = "centauri.conf")]
    config: PathBuf,

    /// Address to connect to for the network config source
    #[arg(long, env = "CONFIG_NETWORK_ADDRESS", default_value = "")]
    config_network_address: String,

    /// Port to listen on for plain HTTP requests
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Port to listen on for HTTPS requests
    #[arg(long, env = "HTTPS_PORT", default_value_t = 8443)]
    https_port: u16,

    /// Path to ACME account data
    #[arg(long, env = "USER_DATA", default_value = "user.json")]
    user_data: PathBuf,

    /// Path to the certificate store
    #[arg(long, env = "CERTIFICATE_STORE", default_value = "certs.json")]
    certificate_store: PathBuf,

    /// Space-separated list of certificate suppliers in order of preference
    #[arg(long, env = "CERTIFICATE_PROVIDERS", default_value = "acme selfsigned")]
    certificate_providers: String,

    /// DNS provider to use for ACME DNS-01 challenges
    #[arg(long, env = "DNS_PROVIDER", default_value = "")]
    dns_provider: String,

    /// Email address for the ACME account
    #[arg(long, env = "ACME_EMAIL", default_value = "")]
    acme_email: String,

    /// ACME directory to use
    #[arg(
        long,
        env = "ACME_DIRECTORY",
        default_value = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    acme_directory: String,

    /// Space-separated list of wildcard base domains
    #[arg(long, env = "WILDCARD_DOMAINS", default_value = "")]
    wildcard_domains: String,

    /// Enable OCSP response stapling
    #[arg(long, env = "OCSP_STAPLING", default_value_t = false)]
    ocsp_stapling: bool,

    /// Comma-separated CIDRs whose X-Forwarded-* headers are trusted
    #[arg(long, env = "TRUSTED_DOWNSTREAMS", default_value = "")]
    trusted_downstreams: String,

    /// Port to expose metrics on; 0 disables
    #[arg(long, env = "METRICS_PORT", default_value_t = 0)]
    metrics_port: u16,

    /// Log level filter
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Parse the configuration, report the result, and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Centauri starting");

    let mut frontend = frontend::create_frontend(&cli.frontend, cli.http_port, cli.https_port)
        .context("invalid frontend specified")?;

    let mut config_source = create_config_source(&cli)?;

    if cli.validate {
        return match config_source.validate().await {
            Ok(()) => {
                println!("Configuration is valid");
                Ok(())
            }
            Err(e) => {
                println!("Configuration is invalid: {e}");
                Err(e.into())
            }
        };
    }

    let provider = if frontend.uses_certificates() {
        Some(
            certs::build_provider(&cli)
                .await
                .context("error creating certificate providers")?,
        )
    } else {
        None
    };

    let trusted_downstreams =
        parse_trusted_downstreams(&cli.trusted_downstreams).context("invalid trusted-downstreams")?;

    let route_manager = Arc::new(RouteManager::new(provider.clone()));
    let rewriter = Arc::new(Rewriter::new(
        Arc::clone(&route_manager),
        trusted_downstreams,
    ));
    let recorder =
        Arc::new(Recorder::new(Arc::clone(&route_manager)).context("metrics setup failed")?);

    if provider.is_some() {
        monitor_certificates(Arc::clone(&route_manager));
    }

    let (metrics_stop_tx, metrics_stop_rx) = watch::channel(false);
    if cli.metrics_port > 0 {
        tokio::spawn(metrics::serve(
            Arc::clone(&recorder),
            cli.metrics_port,
            metrics_stop_rx,
        ));
    }

    let (err_tx, mut err_rx) = mpsc::channel::<CentauriError>(1);

    let apply: Apply = {
        let manager = Arc::clone(&route_manager);
        Arc::new(move |set| {
            let manager = Arc::clone(&manager);
            Box::pin(async move { manager.set_routes(set).await })
        })
    };

    config_source
        .start(apply, err_tx.clone())
        .await
        .context("failed to start config source")?;

    let proxy_service = Arc::new(ProxyService::new(
        Arc::clone(&route_manager),
        Arc::clone(&rewriter),
        Arc::clone(&recorder),
    ));
    frontend
        .serve(
            FrontendContext {
                manager: Arc::clone(&route_manager),
                service: proxy_service,
            },
            err_tx.clone(),
        )
        .await
        .context("failed to start frontend")?;

    info!("Centauri is ready, serving traffic");

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, updating routes");
                config_source.reload();
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, stopping");
                shutdown(&metrics_stop_tx, &mut config_source, &mut frontend).await;
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping");
                shutdown(&metrics_stop_tx, &mut config_source, &mut frontend).await;
                return Ok(());
            }
            Some(err) = err_rx.recv() => {
                match err {
                    CentauriError::ConfigParse(_) | CentauriError::InvalidDomain(_) => {
                        // A bad reload keeps the previous routes in service.
                        warn!(error = %err, "Config update failed; keeping previous routes");
                    }
                    err => {
                        error!(error = %err, "Fatal error, shutting down");
                        frontend.stop().await;
                        config_source.stop().await;
                        return Err(err.into());
                    }
                }
            }
        }
    }
}

fn create_config_source(cli: &Cli) -> anyhow::Result<Box<dyn ConfigSource>> {
    match cli.config_source.to_ascii_lowercase().as_str() {
        "file" => Ok(Box::new(config_file::FileConfigSource::new(
            cli.config.clone(),
        ))),
        "network" => Ok(Box::new(config_network::NetworkConfigSource::new(
            cli.config_network_address.clone(),
        ))),
        other => anyhow::bail!("unknown config source: {other}"),
    }
}

fn parse_trusted_downstreams(value: &str) -> anyhow::Result<Vec<IpNet>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("bad CIDR: {s}")))
        .collect()
}

/// Runs a periodic certificate check for as long as the process lives.
fn monitor_certificates(manager: Arc<RouteManager>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CERTIFICATE_CHECK_INTERVAL).await;
            info!("Checking certificate validity");
            manager.check_certificates().await;
        }
    });
}

/// Ordered graceful shutdown: metrics first, then the config source, then
/// the frontend.
async fn shutdown(
    metrics_stop: &watch::Sender<bool>,
    config_source: &mut Box<dyn ConfigSource>,
    frontend: &mut Box<dyn Frontend>,
) {
    let _ = metrics_stop.send(true);
    config_source.stop().await;
    frontend.stop().await;
    info!("Frontend stopped. Goodbye!");
}
