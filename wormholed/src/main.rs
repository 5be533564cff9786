use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use wormholed::apply::ConfigApplier;
use wormholed::registry::etcd::EtcdRegistry;
use wormholed::{Backend, Config, Service};

#[derive(Parser, Debug)]
#[command(name = "wormholed", version, about = "Forward TCP requests to services registered in etcd")]
struct Cli {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address of etcd backend, including the path of the watched key
    #[arg(long)]
    etcd_addr: Option<String>,

    /// Path of haproxy config file
    #[arg(long)]
    haproxy_conf: Option<PathBuf>,

    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// Print the rendered config once and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("wormholed={}", cli.log_level)))
        )
        .init();

    tracing::info!("Starting wormholed {}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };
    let config = config.with_overrides(cli.etcd_addr, cli.haproxy_conf);
    config.validate()?;

    let (endpoints, key) = config.registry.endpoints_and_key()?;
    let registry = EtcdRegistry::new(&endpoints, config.registry.request_timeout())
        .context("Failed to create etcd client")?;
    tracing::info!(endpoints = ?endpoints, key = %key, "Using etcd backend");

    let backend = Backend::new(Arc::new(registry), key, config.registry.watch_error_threshold);
    let applier = ConfigApplier::from_config(&config.haproxy);
    let service = Service::new(backend, applier, config.reconcile.clone());

    if cli.dry_run {
        let rendered = service.run_once().await?;
        print!("{}", rendered);
        return Ok(());
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    let service_handle = tokio::spawn(service.run(cancel.clone()));

    // Wait for shutdown signal
    shutdown_signal().await?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    if let Err(e) = service_handle.await {
        tracing::error!("Reconciliation loop panicked: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c"),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
