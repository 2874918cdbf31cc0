//! modelship daemon
//!
//! Serves predictions and exposes the model registry over HTTP.

use anyhow::Context;
use clap::Parser;
use modelship_api::{create_router, AppState, ServingFacade};
use modelship_core::{LinearModelLoader, ServerConfig};
use modelship_registry::Registry;
use modelship_store::{FsArtifactStore, PredictorCache};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// modelship daemon - versioned model registry and prediction server
#[derive(Parser, Debug)]
#[command(name = "modelshipd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Registry event log
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Keep the registry in memory only
    #[arg(long, conflicts_with = "log_path")]
    in_memory: bool,

    /// Base directory for relative artifact locations
    #[arg(long)]
    artifact_root: Option<PathBuf>,

    /// Model reference served by /predict
    #[arg(long)]
    model_ref: Option<String>,

    /// Load the served model at startup
    #[arg(long)]
    warm: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Merge command line overrides into the file configuration
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if self.in_memory {
            config.registry.log_path = None;
        } else if let Some(path) = &self.log_path {
            config.registry.log_path = Some(path.clone());
        }
        if let Some(root) = &self.artifact_root {
            config.artifacts.root = root.clone();
        }
        if let Some(model_ref) = &self.model_ref {
            config.serving.model_ref = model_ref.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);

    let result = if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.context("Failed to set subscriber")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    init_logging(&config.logging.level, &config.logging.format)?;

    info!("Starting modelship daemon v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(match &config.registry.log_path {
        Some(path) => Registry::open(path)
            .await
            .with_context(|| format!("Failed to open registry at {}", path.display()))?,
        None => {
            warn!("Registry running in memory; state is lost on exit");
            Registry::in_memory()
        }
    });

    let schemas: std::collections::HashMap<_, _> = config.serving.schemas().into_iter().collect();
    let store = Arc::new(FsArtifactStore::new(config.artifacts.root.clone()));
    let cache = PredictorCache::connect(
        registry.clone(),
        store,
        Arc::new(LinearModelLoader),
        schemas.clone(),
        &config.cache,
    )
    .await;

    let default_ref = config.serving.default_ref()?;
    let facade = Arc::new(ServingFacade::new(cache.clone(), schemas, default_ref.clone()));
    if args.warm {
        if let Err(e) = facade.warm_up().await {
            warn!(
                model_ref = %default_ref,
                error = %e,
                "Warm-up failed; will load on first request"
            );
        }
    }

    let state = Arc::new(AppState {
        registry: registry.clone(),
        cache,
        facade,
    });
    let mut router = create_router(state);
    if config.api.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid address")?;

    info!("API server listening on {}", addr);
    info!(model_ref = %default_ref, "Serving model reference");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.flush().await?;
    info!("Registry flushed, exiting");
    Ok(())
}
