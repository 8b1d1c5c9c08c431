//! yyspider-server - crawl task coordinator
//!
//! Loads configuration, opens the SQLite store and serves workers until
//! Ctrl+C or SIGTERM, then flushes buffered writes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yyspider_common::config::{load_config, ServerConfig, SERVER_CONFIG_FILE};
use yyspider_server::Coordinator;

#[derive(Parser, Debug)]
#[command(name = "yyspider-server")]
#[command(about = "Crawl task coordinator for yyspider workers")]
#[command(version)]
struct Args {
    /// Config file (default: <config dir>/yyspider/yyspider-server.toml)
    #[arg(short, long, env = "YYSPIDER_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "YYSPIDER_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "YYSPIDER_PORT")]
    port: Option<u16>,

    /// Shared secret workers hash their name with
    #[arg(long, env = "YYSPIDER_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// SQLite database file
    #[arg(long, env = "YYSPIDER_DB_PATH")]
    db_path: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secret_key) = self.secret_key {
            config.secret_key = secret_key;
        }
        if let Some(db_path) = self.db_path {
            config.db_path = db_path;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: ServerConfig = load_config(args.config.as_deref(), SERVER_CONFIG_FILE)
        .context("Failed to load configuration")?;
    let config_source = args
        .config
        .clone()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "default location".to_string());
    args.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting yyspider-server v{} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Configuration: {}", config_source);

    config.validate().context("Invalid configuration")?;
    info!("Database: {}", config.db_path.display());
    if let Some(timeout) = config.lease_timeout() {
        info!("Stale leases are reissued after {:?}", timeout);
    }

    let addr = config.bind_addr();
    let coordinator = Arc::new(
        Coordinator::open(config)
            .await
            .context("Failed to open task store")?,
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on {}", addr);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let report = coordinator.run(listener, shutdown).await?;
    if report.failed_batches > 0 {
        warn!(failed_batches = report.failed_batches, "Final flush was incomplete");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
