//! NIM Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use nim_manager::{
    Credentials, InferenceClient, ModelIdentity, NimManager, Reaper, api,
    config::ManagerConfig, gpu, metrics, startup,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "nim-manager")]
#[command(about = "NIM container lifecycle manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override the first host port tried for containers
    #[arg(long)]
    base_port: Option<u16>,

    /// Models to deploy at startup (e.g. FLUX_DEV), in addition to the config
    #[arg(long = "deploy", value_name = "MODEL")]
    deploy: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting NIM Manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(base_port) = cli.base_port {
        config.base_port = base_port;
    }
    for name in &cli.deploy {
        let model: ModelIdentity = name
            .parse()
            .with_context(|| format!("Invalid --deploy value: {}", name))?;
        if !config.deploy.contains(&model) {
            config.deploy.push(model);
        }
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        base_port = config.base_port,
        runtime = %config.runtime_binary,
        deploy = ?config.deploy,
        "Configuration loaded"
    );

    if !config.gpu_devices.is_empty() {
        let missing = gpu::get_or_init().missing_devices(&config.gpu_devices);
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Configured GPU devices were not detected");
        }
    }

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let credentials = Credentials::from_env();
    let deploy = config.deploy.clone();
    let api_port = config.api_port;
    let manager = Arc::new(NimManager::new(config, credentials));
    let mut reaper = Reaper::new(manager.clone());

    // Setup API
    let app_state = api::AppState {
        manager: manager.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Startup deploys can sit in `docker pull` for minutes, so they run
    // beside the server where a shutdown signal still reaches the reaper
    let client = InferenceClient::new(Duration::from_secs(10))?;
    let startup = tokio::spawn(startup::deploy_models(manager.clone(), deploy, client));

    // Graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error");

    tracing::info!("Shutting down...");

    // Cancel first so no deploy records a container after the reaper drains
    startup.abort();
    let _ = startup.await;

    let stopped = reaper.shutdown().await;
    tracing::info!(stopped = stopped, "Shutdown complete");

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
