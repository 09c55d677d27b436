//! SD Model Cache - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use sd_model_cache::{
    EvictionScheduler, HttpDownloader, ModelRegistry, ModelResolver, api, config::AdapterConfig,
    metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "sd-model-cache")]
#[command(about = "Checkpoint and LoRA cache for image-generation workers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override the models volume root
    #[arg(long)]
    models_root: Option<PathBuf>,

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

    tracing::info!("Starting SD model cache");

    // Load configuration
    let mut config = AdapterConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(root) = cli.models_root {
        config.models_root = root;
    }

    config.validate()?;

    let paths = config.paths();
    paths.ensure_directories()?;

    tracing::info!(
        api_port = config.api_port,
        models_root = ?config.models_root,
        single_flight = config.single_flight,
        eviction_interval_secs = config.eviction.interval_secs,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Load registry and build the resolver
    let registry = Arc::new(ModelRegistry::open(paths.registry_file.clone()).await);
    let downloader =
        Arc::new(HttpDownloader::from_config(&config).context("Failed to build HTTP client")?);
    let resolver = Arc::new(
        ModelResolver::new(registry.clone(), downloader, paths)
            .with_single_flight(config.single_flight),
    );

    // Start scheduled eviction
    let scheduler_handle = if config.eviction.interval_secs > 0 {
        let scheduler = Arc::new(EvictionScheduler::new(
            registry.clone(),
            config.eviction.interval_secs,
            config.eviction.max_age_days,
            config.eviction.keep_popular,
        ));
        Some(tokio::spawn(async move {
            scheduler.run().await;
        }))
    } else {
        tracing::info!("Scheduled eviction disabled");
        None
    };

    // Setup API
    let app_state = api::AppState {
        resolver,
        eviction: config.eviction.clone(),
        settle_delay_ms: config.settle_delay_ms,
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }

    // Save final registry state
    tracing::info!("Saving cache registry");
    registry.save().await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
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
    }
}
