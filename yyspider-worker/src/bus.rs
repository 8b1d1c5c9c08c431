//! Client message bus
//!
//! Owns the single connection to the coordinator. Requests are serialized
//! behind a mutex: request N's response is read before request N+1 is sent.
//! When the connection breaks it is dropped and a reconnect is scheduled; the
//! next request waits out the backoff before dialing again.
//!
//! Two loops run on top of the bus:
//! - the task fetcher keeps a bounded local task queue topped up
//! - the result saver ships crawl results back to the coordinator, and on
//!   shutdown keeps draining its queue for a bounded grace period

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yyspider_common::config::WorkerConfig;
use yyspider_common::protocol::{Document, StatusUpdate};
use yyspider_common::{Action, Error, Request, Response, Result};

use crate::connection::ServerConnection;

/// Result of crawling one task, queued for the saver
#[derive(Debug, Clone, PartialEq)]
pub enum WorkResult {
    Data { coll_name: String, records: Vec<Document> },
    Status { coll_name: String, updates: Vec<StatusUpdate> },
}

impl WorkResult {
    pub fn to_request(&self) -> Result<Request> {
        Ok(match self {
            WorkResult::Data { coll_name, records } => {
                Request::new(Action::PutData, coll_name.clone(), serde_json::to_value(records)?)
            }
            WorkResult::Status { coll_name, updates } => Request::new(
                Action::ChangeTaskStatus,
                coll_name.clone(),
                serde_json::to_value(updates)?,
            ),
        })
    }
}

#[derive(Default)]
struct BusState {
    conn: Option<ServerConnection>,
    /// Earliest time the next connect attempt may start
    retry_at: Option<Instant>,
    /// Set while a request awaits its response; still set if that wait was
    /// abandoned, in which case the stream is out of step
    in_flight: bool,
}

pub struct MessageBus {
    config: WorkerConfig,
    state: Mutex<BusState>,
}

impl MessageBus {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.conn.is_some()
    }

    /// Connect now unless already connected or backing off
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.conn.is_some() {
            return Ok(());
        }
        if let Some(retry_at) = state.retry_at {
            if retry_at > Instant::now() {
                return Err(Error::ConnectionClosed);
            }
        }
        self.dial(&mut state).await
    }

    async fn dial(&self, state: &mut BusState) -> Result<()> {
        let addr = self.config.server_addr();
        let opened = ServerConnection::open(
            &addr,
            &self.config.name,
            &self.config.secret_key,
            self.config.max_frame_len,
            self.config.read_timeout(),
        )
        .await;

        match opened {
            Ok(conn) => {
                info!(server = %addr, name = %self.config.name, "Connected to coordinator");
                state.conn = Some(conn);
                state.retry_at = None;
                Ok(())
            }
            Err(e) => {
                let delay = match e {
                    Error::Auth(_) => self.config.auth_retry(),
                    _ => self.config.connect_retry(),
                };
                warn!(server = %addr, "Connect failed: {}; retrying in {:?}", e, delay);
                state.retry_at = Some(Instant::now() + delay);
                Err(e)
            }
        }
    }

    /// Wait out any backoff, then connect if needed
    async fn ensure_connected<'a>(&self, state: &'a mut BusState) -> Result<&'a mut ServerConnection> {
        if state.in_flight {
            state.in_flight = false;
            if state.conn.take().is_some() {
                debug!("Previous request was abandoned, reconnecting");
            }
        }
        if state.conn.is_none() {
            if let Some(retry_at) = state.retry_at {
                tokio::time::sleep_until(retry_at).await;
            }
            self.dial(state).await?;
        }
        state.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    fn drop_connection(&self, state: &mut BusState, reason: &Error) {
        let delay = self.config.connect_retry();
        warn!("Connection lost: {}; reconnecting in {:?}", reason, delay);
        state.conn = None;
        state.retry_at = Some(Instant::now() + delay);
    }

    /// Send one request and wait for its response
    ///
    /// Transport failures drop the connection and are returned; a request
    /// that cannot be framed is returned without touching the connection. A
    /// `FAIL` response is not an error at this level.
    pub async fn do_request(&self, action: Action, coll_name: &str, data: Value) -> Result<Response> {
        self.send_request(Request::new(action, coll_name, data)).await
    }

    pub async fn send_request(&self, request: Request) -> Result<Response> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;

        state.in_flight = true;
        let result = match state.conn.as_mut() {
            Some(conn) => conn.request(request, self.config.read_timeout()).await,
            None => Err(Error::ConnectionClosed),
        };
        state.in_flight = false;

        match result {
            Err(e) if e.is_transport() => {
                self.drop_connection(&mut state, &e);
                Err(e)
            }
            other => other,
        }
    }

    /// Keepalive; a no-op while disconnected
    pub async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(conn) = state.conn.as_mut() else {
            return Ok(());
        };
        if let Err(e) = conn.echo().await {
            self.drop_connection(&mut state, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Keep `tasks` topped up with leased tasks until `shutdown`
    pub async fn run_task_fetcher(self: Arc<Self>, tasks: mpsc::Sender<Document>, shutdown: CancellationToken) {
        let batch_size = self.config.task_batch_size.max(1) as usize;

        loop {
            let headroom = tasks.capacity();
            let pause = if headroom == 0 {
                self.config.poll_interval()
            } else {
                let count = headroom.min(batch_size);
                let data = json!({"count": count, "cond": self.config.task_cond});

                let fetched = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    fetched = self.do_request(Action::GetTask, &self.config.coll_name, data) => fetched,
                };

                match fetched {
                    Ok(response) if response.is_ok() => match response.documents() {
                        Ok(docs) if docs.is_empty() => self.config.empty_backoff(),
                        Ok(docs) => {
                            debug!(count = docs.len(), "Leased tasks");
                            for doc in docs {
                                if tasks.send(doc).await.is_err() {
                                    debug!("Task queue closed, fetcher stopping");
                                    return;
                                }
                            }
                            Duration::ZERO
                        }
                        Err(e) => {
                            warn!("Malformed GET_TASK response: {}", e);
                            self.config.empty_backoff()
                        }
                    },
                    Ok(_) => {
                        warn!(coll_name = %self.config.coll_name, "GET_TASK failed on the server");
                        self.config.empty_backoff()
                    }
                    // Backoff happens inside the next request
                    Err(_) => Duration::ZERO,
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        debug!("Task fetcher stopped");
    }

    /// Ship queued results until `shutdown`, then drain what is left
    ///
    /// After `shutdown` the saver keeps delivering until every sender is
    /// gone and the queue is empty, or `shutdown_grace_ms` runs out.
    pub async fn run_result_saver(self: Arc<Self>, mut results: mpsc::Receiver<WorkResult>, shutdown: CancellationToken) {
        let mut interrupted = None;

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = results.recv() => match item {
                    Some(item) => item,
                    None => {
                        debug!("Result queue closed, saver stopping");
                        return;
                    }
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = Some(item);
                    break;
                }
                _ = self.save(&item) => {}
            }
        }

        self.drain_results(interrupted, &mut results).await;
        debug!("Result saver stopped");
    }

    async fn drain_results(&self, interrupted: Option<WorkResult>, results: &mut mpsc::Receiver<WorkResult>) {
        let grace = self.config.shutdown_grace();
        let mut delivered = 0usize;

        let drain = async {
            if let Some(item) = interrupted {
                self.save(&item).await;
                delivered += 1;
            }
            while let Some(item) = results.recv().await {
                self.save(&item).await;
                delivered += 1;
            }
        };

        let finished = tokio::time::timeout(grace, drain).await.is_ok();
        if finished {
            info!(delivered, "Result queue drained");
        } else {
            warn!(delivered, "Shutdown grace of {:?} elapsed, unsaved results dropped", grace);
        }
    }

    /// Deliver one result
    ///
    /// Transport errors are retried indefinitely and `FAIL` responses a
    /// bounded number of times. A result that cannot be sent at all is
    /// dropped.
    pub async fn save(&self, item: &WorkResult) {
        let request = match item.to_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping unserializable result: {}", e);
                return;
            }
        };

        let mut failures = 0;
        loop {
            match self.send_request(request.clone()).await {
                Ok(response) if response.is_ok() => return,
                Ok(_) => {
                    failures += 1;
                    if failures > self.config.request_fail_retries {
                        warn!(
                            action = %request.action,
                            coll_name = %request.coll_name,
                            attempts = failures,
                            "Server keeps rejecting result, dropping it"
                        );
                        return;
                    }
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                Err(e) if e.is_transport() => {
                    debug!(action = %request.action, "Save failed, will retry: {}", e)
                }
                Err(e) => {
                    warn!(
                        action = %request.action,
                        coll_name = %request.coll_name,
                        "Dropping result: {}",
                        e
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yyspider_common::TaskStatus;

    #[test]
    fn test_work_result_requests() {
        let status = WorkResult::Status {
            coll_name: "books".to_string(),
            updates: vec![StatusUpdate::new(json!("a"), TaskStatus::CrawlFail)],
        };
        let request = status.to_request().unwrap();
        assert_eq!(request.action, Action::ChangeTaskStatus);
        assert_eq!(request.data, json!([{"_id": "a", "status": "CRAWL_FAIL"}]));

        let data = WorkResult::Data {
            coll_name: "books".to_string(),
            records: vec![json!({"_id": "a"}).as_object().cloned().unwrap()],
        };
        assert_eq!(data.to_request().unwrap().action, Action::PutData);
    }

    #[tokio::test]
    async fn test_unreachable_server_schedules_retry() {
        // Reserve a port, then free it so nothing is listening
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = WorkerConfig {
            host: "127.0.0.1".to_string(),
            port,
            secret_key: "k".to_string(),
            connect_retry_ms: 60_000,
            ..WorkerConfig::default()
        };
        let bus = MessageBus::new(config);

        assert!(matches!(bus.connect().await, Err(Error::Io(_))));
        // Backing off: no second dial
        assert!(matches!(bus.connect().await, Err(Error::ConnectionClosed)));
        assert!(!bus.is_connected().await);
        assert!(bus.ping().await.is_ok());
    }
}
