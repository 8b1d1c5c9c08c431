//! Coordinator: accept loop and background tasks

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yyspider_common::config::ServerConfig;
use yyspider_common::{Error, Message, Result};

use crate::connection::handle_connection;
use crate::db_handler::{CleanupReport, DbHandler};
use crate::registry::ConnectionRegistry;
use crate::store::{DocumentStore, SqliteStore};

/// State shared by every connection task
pub struct ServerContext {
    pub config: ServerConfig,
    pub db: Arc<DbHandler>,
    pub registry: ConnectionRegistry,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub struct Coordinator {
    ctx: Arc<ServerContext>,
}

impl Coordinator {
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let db = Arc::new(DbHandler::new(store, &config));
        Self {
            ctx: Arc::new(ServerContext {
                config,
                db,
                registry: ConnectionRegistry::new(),
                started_at: chrono::Utc::now(),
            }),
        }
    }

    /// Open the SQLite store at `config.db_path`
    pub async fn open(config: ServerConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.db_path).await?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn db(&self) -> &Arc<DbHandler> {
        &self.ctx.db
    }

    /// Route a message to the live connection registered as `name`
    pub async fn send_to(&self, name: &str, message: Message) -> Result<()> {
        let peer = self
            .ctx
            .registry
            .lookup(name)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("no connected client named '{}'", name)))?;
        peer.send(message).await
    }

    /// Send `ECHO_MESSAGE` to every connected client
    ///
    /// Returns how many connections accepted it.
    pub async fn broadcast_echo(&self) -> usize {
        let mut delivered = 0;
        for peer in self.ctx.registry.snapshot().await {
            match peer.send(Message::Echo).await {
                Ok(()) => delivered += 1,
                Err(_) => debug!(name = %peer.name, "Echo to closed connection skipped"),
            }
        }
        delivered
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "Accepted connection");
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(%peer_addr, "set_nodelay failed: {}", e);
                            }
                            tokio::spawn(handle_connection(
                                stream,
                                peer_addr,
                                Arc::clone(&self.ctx),
                                shutdown.child_token(),
                            ));
                        }
                        Err(e) => {
                            // Usually fd exhaustion; keep accepting
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    /// Run the coordinator until `shutdown` fires, then flush
    ///
    /// Spawns the cleanup loop, the optional keepalive loop and the optional
    /// status endpoint next to the accept loop.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<CleanupReport> {
        let config = &self.ctx.config;
        let mut background = Vec::new();

        background.push(tokio::spawn(
            Arc::clone(&self.ctx.db).run_cleanup_loop(config.cleanup_interval(), shutdown.child_token()),
        ));

        if let Some(interval) = config.keepalive_interval() {
            let coordinator = Arc::clone(&self);
            let token = shutdown.child_token();
            background.push(tokio::spawn(async move {
                coordinator.run_keepalive_loop(interval, token).await;
            }));
        }

        if let Some(port) = config.status_port {
            let addr = format!("{}:{}", config.host, port);
            let status_listener = TcpListener::bind(&addr).await?;
            info!("Status endpoint listening on http://{}", addr);

            let router = crate::api::build_router(Arc::clone(&self.ctx));
            let token = shutdown.child_token();
            background.push(tokio::spawn(async move {
                let served = axum::serve(status_listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
                if let Err(e) = served {
                    error!("Status endpoint failed: {}", e);
                }
            }));
        }

        self.serve(listener, shutdown.clone()).await?;

        for task in background {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Flushing pending writes");
        Ok(self.ctx.db.cleanup().await)
    }

    async fn run_keepalive_loop(&self, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let delivered = self.broadcast_echo().await;
                    debug!(delivered, "Keepalive echo sent");
                }
            }
        }
    }
}
