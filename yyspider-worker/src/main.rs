//! yyspider-worker - crawl worker
//!
//! Connects to a coordinator, keeps a local queue of leased tasks, crawls
//! them with a small pool of fetchers and reports results until Ctrl+C or
//! SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yyspider_common::config::{load_config, WorkerConfig, WORKER_CONFIG_FILE};
use yyspider_worker::{Crawler, MessageBus};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "yyspider-worker")]
#[command(about = "Crawl worker for a yyspider coordinator")]
#[command(version)]
struct Args {
    /// Config file (default: <config dir>/yyspider/yyspider-worker.toml)
    #[arg(short, long, env = "YYSPIDER_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Coordinator host
    #[arg(long, env = "YYSPIDER_HOST")]
    host: Option<String>,

    /// Coordinator port
    #[arg(short, long, env = "YYSPIDER_PORT")]
    port: Option<u16>,

    /// Name this worker authenticates as
    #[arg(short, long, env = "YYSPIDER_WORKER_NAME")]
    name: Option<String>,

    /// Shared secret
    #[arg(long, env = "YYSPIDER_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Collection to lease tasks from and save results to
    #[arg(long, env = "YYSPIDER_COLL_NAME")]
    coll_name: Option<String>,
}

impl Args {
    fn apply(self, config: &mut WorkerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(secret_key) = self.secret_key {
            config.secret_key = secret_key;
        }
        if let Some(coll_name) = self.coll_name {
            config.coll_name = coll_name;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: WorkerConfig = load_config(args.config.as_deref(), WORKER_CONFIG_FILE)
        .context("Failed to load configuration")?;
    args.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting yyspider-worker v{}", env!("CARGO_PKG_VERSION"));
    config.validate().context("Invalid configuration")?;
    info!(
        "Worker '{}' -> {} (collection '{}', {} crawlers)",
        config.name,
        config.server_addr(),
        config.coll_name,
        config.crawl_concurrency
    );

    let crawler = Arc::new(
        Crawler::new(config.coll_name.clone(), config.crawl_timeout())
            .context("Failed to build HTTP client")?
            .with_max_body_len(config.max_body_len),
    );

    let (task_tx, task_rx) = mpsc::channel(config.task_queue_size);
    let (result_tx, result_rx) = mpsc::channel(config.result_queue_size);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let crawl_concurrency = config.crawl_concurrency;

    let bus = Arc::new(MessageBus::new(config));
    if let Err(e) = bus.connect().await {
        warn!("Initial connect failed: {}", e);
    }

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    workers.push(tokio::spawn(
        Arc::clone(&bus).run_task_fetcher(task_tx, shutdown.child_token()),
    ));
    workers.push(tokio::spawn(
        Arc::clone(&bus).run_result_saver(result_rx, shutdown.child_token()),
    ));
    for _ in 0..crawl_concurrency {
        workers.push(tokio::spawn(Arc::clone(&crawler).run(
            Arc::clone(&task_rx),
            result_tx.clone(),
            shutdown.child_token(),
        )));
    }
    drop(result_tx);

    workers.push(tokio::spawn({
        let bus = Arc::clone(&bus);
        let shutdown = shutdown.child_token();
        async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = bus.ping().await {
                            debug!("Keepalive failed: {}", e);
                        }
                    }
                }
            }
        }
    }));

    shutdown_signal().await;
    shutdown.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }

    info!("Worker shutdown complete");
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
