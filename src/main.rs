//! llamactl - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use llamactl::{
    Heartbeat, InstanceRegistry, LifecycleManager, SettingsStore, SystemProcessDriver, Watchdog,
    api, config::ManagerConfig, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{Notify, RwLock};

#[derive(Parser, Debug)]
#[command(name = "llamactl")]
#[command(about = "Local control plane for llama-server model instances", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Disable the heartbeat watchdog (headless operation)
    #[arg(long)]
    no_watchdog: bool,

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
                .with_env_filter(cli.log_level.as_str())
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(cli.log_level.as_str())
                .json()
                .init();
        }
    }

    tracing::info!("Starting llamactl");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if cli.no_watchdog {
        config.heartbeat_enabled = false;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        settings_file = ?config.settings_file,
        heartbeat_enabled = config.heartbeat_enabled,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Load persisted settings
    let settings_store = Arc::new(SettingsStore::new(config.settings_file.clone()));
    let settings = settings_store.load().await;

    tracing::info!(
        bind = %settings.bind,
        model_dir = ?settings.model_dir,
        llama_server = %settings.llama_server,
        "Settings loaded"
    );

    let bind_ip: std::net::IpAddr = settings
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address in settings: {}", settings.bind))?;

    // Wire up the lifecycle core
    let registry = Arc::new(InstanceRegistry::new());
    let driver = Arc::new(SystemProcessDriver::new());
    let manager = Arc::new(LifecycleManager::new(
        registry,
        driver,
        Arc::new(RwLock::new(settings)),
        config.clone(),
    ));

    // Heartbeat watchdog
    let heartbeat = Arc::new(Heartbeat::new());
    let shutdown = Arc::new(Notify::new());

    let watchdog_handle = if config.heartbeat_enabled {
        let watchdog = Arc::new(Watchdog::new(
            manager.clone(),
            heartbeat.clone(),
            Duration::from_secs(config.heartbeat_timeout_secs),
            Duration::from_secs(config.heartbeat_poll_secs),
            shutdown.clone(),
        ));
        Some(tokio::spawn(watchdog.run()))
    } else {
        tracing::info!("Heartbeat watchdog disabled");
        None
    };

    // Setup API
    let app_state = api::AppState {
        manager: manager.clone(),
        settings_store,
        heartbeat,
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from((bind_ip, config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown on signal or watchdog timeout
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Stop all managed instances. Discovered external instances are left
    // alone; reaping them is opt-in through the API.
    let stopped = manager.stop_all(false).await;
    tracing::info!(stopped = stopped, "Managed instances stopped");

    if let Some(handle) = watchdog_handle {
        handle.abort();
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(watchdog_fired: Arc<Notify>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
        _ = watchdog_fired.notified() => {
            tracing::info!("Watchdog requested shutdown");
        },
    }
}
