//! Coordinator instance for integration tests
//!
//! Binds 127.0.0.1:0, stores data in a temp directory and never flushes on
//! its own (the cleanup interval is an hour) so tests control when writes
//! reach the store.

use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use yyspider_common::config::ServerConfig;
use yyspider_server::store::DocumentStore;
use yyspider_server::{CleanupReport, Coordinator};

pub const TEST_KEY: &str = "test-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
    handle: JoinHandle<yyspider_common::Result<CleanupReport>>,
    _dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start with config adjustments applied on top of the test defaults
    pub async fn start_with(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = TempDir::new().unwrap();

        let mut config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            secret_key: TEST_KEY.to_string(),
            db_path: dir.path().join("yyspider.db"),
            cleanup_interval_ms: 3_600_000,
            handshake_timeout_ms: 2_000,
            ..ServerConfig::default()
        };
        configure(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let coordinator = Arc::new(Coordinator::open(config).await.unwrap());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&coordinator).run(listener, shutdown.clone()));

        TestServer {
            addr,
            coordinator,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.coordinator.db().store()
    }

    /// Run one cleanup pass now
    pub async fn flush(&self) -> CleanupReport {
        self.coordinator.db().cleanup().await
    }

    /// Today's value of a stats counter (after a flush)
    pub async fn stat(&self, coll_name: &str, event_type: &str) -> i64 {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        self.store().stat_count(&today, coll_name, event_type).await.unwrap()
    }

    /// Cancel and wait for the final flush
    pub async fn stop(self) -> (CleanupReport, Arc<Coordinator>) {
        self.shutdown.cancel();
        let report = self.handle.await.unwrap().unwrap();
        (report, self.coordinator)
    }
}
