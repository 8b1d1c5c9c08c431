//! In-process coordinator for worker tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use yyspider_common::config::{ServerConfig, WorkerConfig};
use yyspider_server::store::DocumentStore;

pub const TEST_KEY: &str = "worker-test-secret";

pub struct Coordinator {
    pub addr: SocketAddr,
    pub inner: Arc<yyspider_server::Coordinator>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl Coordinator {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            secret_key: TEST_KEY.to_string(),
            db_path: dir.path().join("yyspider.db"),
            cleanup_interval_ms: 3_600_000,
            ..ServerConfig::default()
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inner = Arc::new(yyspider_server::Coordinator::open(config).await.unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&inner).run(listener, shutdown.clone()));

        Coordinator {
            addr,
            inner,
            shutdown,
            _dir: dir,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.inner.db().store()
    }

    pub async fn flush(&self) {
        self.inner.db().cleanup().await;
    }

    /// Flush repeatedly until `check` holds or five seconds pass
    pub async fn flush_until<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            self.flush().await;
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Worker config pointing at `addr` with short test timings
pub fn worker_config(addr: SocketAddr) -> WorkerConfig {
    WorkerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        name: "test-worker".to_string(),
        secret_key: TEST_KEY.to_string(),
        coll_name: "books".to_string(),
        empty_backoff_ms: 50,
        poll_interval_ms: 20,
        connect_retry_ms: 100,
        auth_retry_ms: 100,
        read_timeout_ms: 5_000,
        shutdown_grace_ms: 2_000,
        ..WorkerConfig::default()
    }
}
