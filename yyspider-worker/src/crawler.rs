//! HTTP crawler
//!
//! Takes leased tasks off the local queue, fetches each task's `url` and
//! queues a scraped record plus a status update for the result saver.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yyspider_common::protocol::{Document, StatusUpdate, ID_FIELD};
use yyspider_common::TaskStatus;

use crate::bus::WorkResult;

/// Field holding the address to fetch
pub const URL_FIELD: &str = "url";

/// Body bytes kept per page unless configured otherwise
pub const DEFAULT_MAX_BODY_LEN: usize = 512 * 1024;

/// What came of fetching one task
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlOutcome {
    Fetched(Document),
    Failed(String),
}

pub struct Crawler {
    client: reqwest::Client,
    coll_name: String,
    max_body_len: usize,
}

impl Crawler {
    pub fn new(coll_name: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("yyspider-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            coll_name: coll_name.into(),
            max_body_len: DEFAULT_MAX_BODY_LEN,
        })
    }

    /// Keep at most `max_body_len` bytes of each page
    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    /// Fetch the task's url and build its scraped record
    pub async fn crawl(&self, task: &Document) -> CrawlOutcome {
        let Some(url) = task.get(URL_FIELD).and_then(Value::as_str) else {
            return CrawlOutcome::Failed("task has no url".to_string());
        };

        let mut response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return CrawlOutcome::Failed(e.to_string()),
        };
        let status = response.status();
        if !status.is_success() {
            return CrawlOutcome::Failed(format!("HTTP {}", status));
        }

        let mut body = Vec::new();
        let mut truncated = false;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.max_body_len - body.len();
                    if chunk.len() > room {
                        body.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return CrawlOutcome::Failed(e.to_string()),
            }
        }
        if truncated {
            debug!(url, limit = self.max_body_len, "Body truncated");
        }

        let body = String::from_utf8_lossy(&body).into_owned();
        CrawlOutcome::Fetched(
            json!({
                "_id": task.get(ID_FIELD).cloned().unwrap_or(Value::Null),
                "url": url,
                "status_code": status.as_u16(),
                "content_length": body.len(),
                "truncated": truncated,
                "body": body,
                "fetched_at": chrono::Utc::now().timestamp(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        )
    }

    /// Results to queue for one crawled task
    pub fn results_for(&self, task: &Document, outcome: CrawlOutcome) -> Vec<WorkResult> {
        let id = task.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        let mut update = StatusUpdate::new(id, TaskStatus::CrawlFail);
        update.last_crawl_time = Some(chrono::Utc::now().timestamp());

        match outcome {
            CrawlOutcome::Fetched(record) => {
                update.status = TaskStatus::CrawlSuccess;
                vec![
                    WorkResult::Data {
                        coll_name: self.coll_name.clone(),
                        records: vec![record],
                    },
                    WorkResult::Status {
                        coll_name: self.coll_name.clone(),
                        updates: vec![update],
                    },
                ]
            }
            CrawlOutcome::Failed(reason) => {
                warn!(id = %update.id, "Crawl failed: {}", reason);
                vec![WorkResult::Status {
                    coll_name: self.coll_name.clone(),
                    updates: vec![update],
                }]
            }
        }
    }

    /// Crawl tasks from the shared queue until it closes or `shutdown`
    pub async fn run(
        self: Arc<Self>,
        tasks: Arc<Mutex<mpsc::Receiver<Document>>>,
        results: mpsc::Sender<WorkResult>,
        shutdown: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = async { tasks.lock().await.recv().await } => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.crawl(&task) => outcome,
            };

            for result in self.results_for(&task, outcome) {
                if results.send(result).await.is_err() {
                    debug!("Result queue closed, crawler stopping");
                    return;
                }
            }
        }
    }
}
