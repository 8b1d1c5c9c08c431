//! DB handler: request execution, write buffering and periodic flush
//!
//! Mutating requests never touch storage directly. Their writes are appended
//! to the collection's write queue and applied by [`DbHandler::cleanup`],
//! which runs on a fixed interval and once more at shutdown. Leases are the
//! exception: `GET_TASK` goes straight to the store so that a task is
//! marked `CRAWLING` before it is handed out. A lease never hands out more
//! than one response frame can carry; tasks that do not fit are put back.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yyspider_common::codec::DEFAULT_MAX_FRAME_LEN;
use yyspider_common::config::ServerConfig;
use yyspider_common::protocol::{
    document_id, id_key, Document, GetTaskParams, Operation, Request, Response, StatusUpdate,
    TaskStatus,
};
use yyspider_common::{Error, Message, MessageCodec, Result};

use crate::stats::{StatEvent, StatsQueue, ALL_COLLECTIONS};
use crate::store::{DocumentStore, LeaseRequest, WriteOp};
use crate::write_queue::{pending_task_ids, WriteQueues};

/// Summary of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub collections: usize,
    pub ops_flushed: usize,
    pub op_errors: usize,
    pub stats_flushed: usize,
    /// Batches that failed as a whole (connection, transaction)
    pub failed_batches: usize,
}

impl CleanupReport {
    fn is_empty(&self) -> bool {
        self.ops_flushed == 0 && self.stats_flushed == 0 && self.failed_batches == 0
    }
}

pub struct DbHandler {
    store: Arc<dyn DocumentStore>,
    queues: WriteQueues,
    stats: StatsQueue,
    write_queue_max: usize,
    lease_timeout: Option<Duration>,
    max_response_len: usize,
}

/// Widest MessagePack array header (array32) minus the empty fixarray
const ARRAY_HEADER_SLACK: usize = 4;

fn validate_coll_name(coll_name: &str) -> Result<()> {
    if coll_name.is_empty() {
        return Err(Error::InvalidInput("empty collection name".to_string()));
    }
    if coll_name == ALL_COLLECTIONS {
        return Err(Error::InvalidInput(format!(
            "collection name '{}' is reserved",
            ALL_COLLECTIONS
        )));
    }
    Ok(())
}

impl DbHandler {
    pub fn new(store: Arc<dyn DocumentStore>, config: &ServerConfig) -> Self {
        Self::with_limits(store, config.write_queue_max, config.lease_timeout())
            .with_max_response_len(config.max_frame_len)
    }

    pub fn with_limits(
        store: Arc<dyn DocumentStore>,
        write_queue_max: usize,
        lease_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            queues: WriteQueues::new(),
            stats: StatsQueue::new(),
            write_queue_max: write_queue_max.max(1),
            lease_timeout,
            max_response_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Cap the encoded size of a `GET_TASK` response
    pub fn with_max_response_len(mut self, max_response_len: usize) -> Self {
        self.max_response_len = max_response_len;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Execute a request and always produce a response
    ///
    /// Errors are logged and turned into `FAIL` with empty data.
    pub async fn handle_request(&self, request: &Request) -> Response {
        match self.execute(request).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                warn!(
                    action = %request.action,
                    coll_name = %request.coll_name,
                    "Request failed: {}",
                    e
                );
                Response::fail()
            }
        }
    }

    pub async fn execute(&self, request: &Request) -> Result<Value> {
        let coll_name = request.coll_name.as_str();
        let empty = || Value::Array(Vec::new());

        match request.operation()? {
            Operation::PutTask(tasks) => {
                self.put_task(coll_name, tasks).await?;
                Ok(empty())
            }
            Operation::GetTask(params) => {
                let tasks = self.get_task(coll_name, &params).await?;
                Ok(Value::Array(tasks.into_iter().map(Value::Object).collect()))
            }
            Operation::PutData(records) => {
                self.put_data(coll_name, records).await?;
                Ok(empty())
            }
            Operation::ChangeTaskStatus(updates) => {
                self.change_task_status(coll_name, updates).await?;
                Ok(empty())
            }
        }
    }

    /// Queue inserts for tasks not already stored or pending
    ///
    /// Returns the number of newly queued tasks.
    pub async fn put_task(&self, coll_name: &str, tasks: Vec<Document>) -> Result<usize> {
        validate_coll_name(coll_name)?;

        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(tasks.len());
        for doc in tasks {
            let id = document_id(&doc)?;
            if seen.insert(id.clone()) {
                batch.push((id, doc));
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        // The queue lock is held from the existence check until the inserts
        // are queued, so a concurrent put_task of the same id sees one or
        // the other.
        let queue = self.queues.queue(coll_name).await;
        let mut pending = queue.lock().await;

        let ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();
        let stored = self.store.existing_task_ids(coll_name, &ids).await?;
        let queued: HashSet<String> = pending_task_ids(&pending)
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut added = 0;
        for (id, doc) in batch {
            if stored.contains(&id) || queued.contains(&id) {
                continue;
            }
            let status = doc
                .get("status")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<TaskStatus>().ok())
                .unwrap_or(TaskStatus::NotCrawl);
            pending.push(WriteOp::InsertTask { id, status, doc });
            added += 1;
        }

        debug!(coll_name, added, skipped = ids.len() - added, "put_task");
        self.stats.record(coll_name, StatEvent::NewTask, added as i64).await;

        if pending.len() >= self.write_queue_max {
            let ops = std::mem::take(&mut *pending);
            self.flush_collection(coll_name, ops, &mut CleanupReport::default()).await;
        }

        Ok(added)
    }

    /// Lease up to `count` matching NOT_CRAWL tasks
    pub async fn get_task(&self, coll_name: &str, params: &GetTaskParams) -> Result<Vec<Document>> {
        validate_coll_name(coll_name)?;

        let now = chrono::Utc::now().timestamp();
        let stale_before = self
            .lease_timeout
            .map(|timeout| now - timeout.as_secs() as i64);

        let tasks = self
            .store
            .lease_tasks(LeaseRequest {
                coll_name,
                count: params.count,
                cond: &params.cond,
                now,
                stale_before,
            })
            .await?;

        let leased = tasks.len();
        let tasks = self.fit_response(coll_name, tasks).await?;

        debug!(
            coll_name,
            requested = params.count,
            leased,
            returned = tasks.len(),
            "get_task"
        );
        Ok(tasks)
    }

    /// Keep the leased tasks that fit in one response frame, release the rest
    ///
    /// Tasks that cannot fit even alone are marked `CRAWL_FAIL` so they stop
    /// being leased.
    async fn fit_response(&self, coll_name: &str, tasks: Vec<Document>) -> Result<Vec<Document>> {
        let envelope =
            MessageCodec::encoded_len(&Message::Response(Response::ok_empty()))? + ARRAY_HEADER_SLACK;

        let mut used = envelope;
        let mut fitting = Vec::with_capacity(tasks.len());
        let mut overflow = Vec::new();
        let mut oversized = Vec::new();

        for task in tasks {
            let len = MessageCodec::encoded_len(&task)?;
            if envelope + len > self.max_response_len {
                oversized.push(document_id(&task)?);
            } else if used + len > self.max_response_len {
                overflow.push(document_id(&task)?);
            } else {
                used += len;
                fitting.push(task);
            }
        }

        if !overflow.is_empty() {
            let released = self
                .store
                .release_tasks(coll_name, &overflow, TaskStatus::NotCrawl)
                .await?;
            debug!(coll_name, released, "Released leased tasks beyond the response limit");
        }
        if !oversized.is_empty() {
            warn!(
                coll_name,
                ids = ?oversized,
                limit = self.max_response_len,
                "Tasks too large for any response, marking CRAWL_FAIL"
            );
            self.store
                .release_tasks(coll_name, &oversized, TaskStatus::CrawlFail)
                .await?;
        }

        Ok(fitting)
    }

    pub async fn change_task_status(&self, coll_name: &str, updates: Vec<StatusUpdate>) -> Result<()> {
        validate_coll_name(coll_name)?;

        let now = chrono::Utc::now().timestamp();
        let mut ops = Vec::with_capacity(updates.len());
        let mut successes = 0;
        for update in updates {
            if update.status.is_success() {
                successes += 1;
            }
            ops.push(WriteOp::UpdateStatus {
                id: id_key(&update.id)?,
                status: update.status,
                last_crawl_time: update.last_crawl_time.unwrap_or(now),
            });
        }

        self.enqueue(coll_name, ops).await;
        self.stats.record(coll_name, StatEvent::CrawlSuccess, successes).await;
        Ok(())
    }

    pub async fn put_data(&self, coll_name: &str, records: Vec<Document>) -> Result<()> {
        validate_coll_name(coll_name)?;

        let ops = records
            .into_iter()
            .map(|doc| Ok(WriteOp::UpsertData { id: document_id(&doc)?, doc }))
            .collect::<Result<Vec<_>>>()?;
        let saved = ops.len() as i64;

        self.enqueue(coll_name, ops).await;
        self.stats.record(coll_name, StatEvent::DataSaved, saved).await;
        Ok(())
    }

    async fn enqueue(&self, coll_name: &str, ops: Vec<WriteOp>) {
        if ops.is_empty() {
            return;
        }

        let queue = self.queues.queue(coll_name).await;
        let mut pending = queue.lock().await;
        pending.extend(ops);

        if pending.len() >= self.write_queue_max {
            let ops = std::mem::take(&mut *pending);
            self.flush_collection(coll_name, ops, &mut CleanupReport::default()).await;
        }
    }

    async fn flush_collection(&self, coll_name: &str, ops: Vec<WriteOp>, report: &mut CleanupReport) {
        report.collections += 1;

        match self.store.bulk_write(coll_name, &ops).await {
            Ok(result) => {
                report.ops_flushed += result.succeeded();
                report.op_errors += result.errors.len();
                for failure in &result.errors {
                    match ops.get(failure.index) {
                        Some(op) => warn!(
                            coll_name,
                            index = failure.index,
                            op = op.kind(),
                            id = op.id(),
                            "Write failed: {}",
                            failure.message
                        ),
                        None => warn!(coll_name, index = failure.index, "Write failed: {}", failure.message),
                    }
                }
            }
            Err(e) => {
                report.failed_batches += 1;
                error!(coll_name, dropped = ops.len(), "Bulk write failed: {}", e);
            }
        }
    }

    /// Flush every write queue and the stats queue
    ///
    /// Drained operations are never re-queued, even when the flush fails.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for coll_name in self.queues.collections().await {
            let queue = self.queues.queue(&coll_name).await;
            let mut pending = queue.lock().await;
            if pending.is_empty() {
                continue;
            }
            let ops = std::mem::take(&mut *pending);
            self.flush_collection(&coll_name, ops, &mut report).await;
        }

        let increments = self.stats.drain().await;
        if !increments.is_empty() {
            match self.store.increment_stats(&increments).await {
                Ok(result) => {
                    report.stats_flushed += result.succeeded();
                    report.op_errors += result.errors.len();
                    for failure in &result.errors {
                        warn!(index = failure.index, "Stats increment failed: {}", failure.message);
                    }
                }
                Err(e) => {
                    report.failed_batches += 1;
                    error!(dropped = increments.len(), "Stats flush failed: {}", e);
                }
            }
        }

        if report.is_empty() {
            debug!("Cleanup: nothing to flush");
        } else {
            info!(
                collections = report.collections,
                ops = report.ops_flushed,
                stats = report.stats_flushed,
                errors = report.op_errors,
                failed_batches = report.failed_batches,
                "Cleanup flushed"
            );
        }

        report
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires
    pub async fn run_cleanup_loop(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Cleanup loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }

    pub async fn queue_depths(&self) -> BTreeMap<String, usize> {
        self.queues.depths().await
    }

    /// Distinct stats rows waiting for the next flush
    pub async fn pending_stats(&self) -> usize {
        self.stats.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{stat_date, StatIncrement};
    use crate::store::{BulkWriteReport, SqliteStore};
    use async_trait::async_trait;
    use serde_json::json;
    use yyspider_common::protocol::Action;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn tasks(ids: &[&str]) -> Vec<Document> {
        ids.iter()
            .map(|id| doc(json!({"_id": id, "url": format!("http://example.com/{}", id)})))
            .collect()
    }

    async fn handler() -> DbHandler {
        let store = SqliteStore::open_in_memory().await.unwrap();
        DbHandler::with_limits(Arc::new(store), 1000, None)
    }

    fn today() -> String {
        stat_date(chrono::Utc::now())
    }

    /// Store whose every call fails
    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn existing_task_ids(&self, _: &str, _: &[String]) -> Result<HashSet<String>> {
            Err(Error::Storage("down".to_string()))
        }
        async fn lease_tasks(&self, _: LeaseRequest<'_>) -> Result<Vec<Document>> {
            Err(Error::Storage("down".to_string()))
        }
        async fn release_tasks(&self, _: &str, _: &[String], _: TaskStatus) -> Result<u64> {
            Err(Error::Storage("down".to_string()))
        }
        async fn bulk_write(&self, _: &str, _: &[WriteOp]) -> Result<BulkWriteReport> {
            Err(Error::Storage("down".to_string()))
        }
        async fn increment_stats(&self, _: &[StatIncrement]) -> Result<BulkWriteReport> {
            Err(Error::Storage("down".to_string()))
        }
        async fn find_task(&self, _: &str, _: &str) -> Result<Option<Document>> {
            Ok(None)
        }
        async fn find_data(&self, _: &str, _: &str) -> Result<Option<Document>> {
            Ok(None)
        }
        async fn stat_count(&self, _: &str, _: &str, _: &str) -> Result<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_put_task_is_idempotent() {
        let handler = handler().await;

        assert_eq!(handler.put_task("books", tasks(&["a", "b", "a"])).await.unwrap(), 2);
        // Pending in queue
        assert_eq!(handler.put_task("books", tasks(&["a", "b"])).await.unwrap(), 0);
        handler.cleanup().await;
        // Already stored
        assert_eq!(handler.put_task("books", tasks(&["a", "b", "c"])).await.unwrap(), 1);
        handler.cleanup().await;

        let store = handler.store();
        assert_eq!(store.stat_count(&today(), "books", "new_task").await.unwrap(), 3);
        assert_eq!(store.stat_count(&today(), "all", "new_task").await.unwrap(), 3);
        assert_eq!(stored_task_count(&handler, &["a", "b", "c", "d"]).await, 3);
    }

    async fn stored_task_count(handler: &DbHandler, ids: &[&str]) -> usize {
        let mut n = 0;
        for id in ids {
            if handler.store().find_task("books", id).await.unwrap().is_some() {
                n += 1;
            }
        }
        n
    }

    #[tokio::test]
    async fn test_get_task_leases_once() {
        let handler = handler().await;
        handler.put_task("books", tasks(&["a", "b"])).await.unwrap();
        handler.cleanup().await;

        let params = GetTaskParams { count: 5, cond: Document::new() };
        let first = handler.get_task("books", &params).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|t| t["status"] == json!("CRAWLING")));
        assert!(handler.get_task("books", &params).await.unwrap().is_empty());
    }

    fn padded(id: &str, pad: usize) -> Document {
        doc(json!({"_id": id, "pad": "x".repeat(pad)}))
    }

    /// Given three leasable tasks of which only two fit in one response
    /// Then two are handed out and the third stays leasable
    #[tokio::test]
    async fn test_get_task_respects_response_limit() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let handler = DbHandler::with_limits(Arc::new(store), 1000, None).with_max_response_len(800);
        let batch = vec![padded("a", 300), padded("b", 300), padded("c", 300)];
        handler.put_task("books", batch).await.unwrap();
        handler.cleanup().await;

        let params = GetTaskParams { count: 3, cond: Document::new() };
        let first = handler.get_task("books", &params).await.unwrap();
        assert_eq!(first.len(), 2);

        let response = Response::ok(Value::Array(first.into_iter().map(Value::Object).collect()));
        let encoded = MessageCodec::encoded_len(&Message::Response(response)).unwrap();
        assert!(encoded <= 800);

        let second = handler.get_task("books", &params).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["_id"], json!("c"));
    }

    #[tokio::test]
    async fn test_task_larger_than_any_response_is_failed() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let handler = DbHandler::with_limits(Arc::new(store), 1000, None).with_max_response_len(800);
        handler
            .put_task("books", vec![padded("huge", 2_000), padded("small", 10)])
            .await
            .unwrap();
        handler.cleanup().await;

        let params = GetTaskParams { count: 5, cond: Document::new() };
        let leased = handler.get_task("books", &params).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0]["_id"], json!("small"));

        let huge = handler.store().find_task("books", "huge").await.unwrap().unwrap();
        assert_eq!(huge["status"], json!("CRAWL_FAIL"));
        assert!(handler.get_task("books", &params).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_task_with_cond() {
        let handler = handler().await;
        let batch = vec![
            doc(json!({"_id": 1, "site": "a"})),
            doc(json!({"_id": 2, "site": "b"})),
        ];
        handler.put_task("books", batch).await.unwrap();
        handler.cleanup().await;

        let params = GetTaskParams {
            count: 5,
            cond: doc(json!({"site": "b"})),
        };
        let leased = handler.get_task("books", &params).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0]["_id"], json!(2));
    }

    #[tokio::test]
    async fn test_change_task_status_counts_success_only() {
        let handler = handler().await;
        handler.put_task("books", tasks(&["a", "b"])).await.unwrap();

        let updates = vec![
            StatusUpdate::new(json!("a"), TaskStatus::CrawlSuccess),
            StatusUpdate::new(json!("b"), TaskStatus::CrawlFail),
        ];
        handler.change_task_status("books", updates).await.unwrap();
        handler.cleanup().await;

        let store = handler.store();
        assert_eq!(store.stat_count(&today(), "books", "crawl_success").await.unwrap(), 1);
        let a = store.find_task("books", "a").await.unwrap().unwrap();
        assert_eq!(a["status"], json!("CRAWL_SUCCESS"));
        assert!(a["last_crawl_time"].as_i64().unwrap() > 0);
        let b = store.find_task("books", "b").await.unwrap().unwrap();
        assert_eq!(b["status"], json!("CRAWL_FAIL"));
    }

    #[tokio::test]
    async fn test_put_data_replay_keeps_one_record() {
        let handler = handler().await;
        let records = vec![doc(json!({"_id": "a", "title": "first"}))];
        handler.put_data("books", records).await.unwrap();
        handler.put_data("books", vec![doc(json!({"_id": "a", "title": "second"}))]).await.unwrap();
        handler.cleanup().await;

        let stored = handler.store().find_data("books", "a").await.unwrap().unwrap();
        assert_eq!(stored["title"], json!("second"));
        assert_eq!(
            handler.store().stat_count(&today(), "books", "data_saved").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_queue_overflow_flushes_inline() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let handler = DbHandler::with_limits(Arc::new(store), 2, None);

        handler.put_task("books", tasks(&["a", "b", "c"])).await.unwrap();
        assert_eq!(handler.queue_depths().await.get("books"), Some(&0));
        assert!(handler.store().find_task("books", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reserved_and_empty_collection_rejected() {
        let handler = handler().await;
        assert!(handler.put_task("all", tasks(&["a"])).await.is_err());
        assert!(handler.put_data("", tasks(&["a"])).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_id_rejected() {
        let handler = handler().await;
        let err = handler
            .put_task("books", vec![doc(json!({"url": "x"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_handle_request_maps_errors_to_fail() {
        let handler = DbHandler::with_limits(Arc::new(BrokenStore), 10, None);

        let request = Request::new(Action::GetTask, "books", json!({"count": 1}));
        let response = handler.handle_request(&request).await;
        assert!(!response.is_ok());
        assert_eq!(response.data, json!([]));

        // Malformed data for the action
        let request = Request::new(Action::PutTask, "books", json!({"not": "a list"}));
        assert!(!handler.handle_request(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_drops_failed_batch() {
        let handler = DbHandler::with_limits(Arc::new(BrokenStore), 10, None);
        handler.put_data("books", tasks(&["a"])).await.unwrap();

        let report = handler.cleanup().await;
        assert_eq!(report.failed_batches, 2);
        assert_eq!(handler.queue_depths().await.get("books"), Some(&0));
        assert_eq!(handler.pending_stats().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_loop_stops_on_cancel() {
        let handler = Arc::new(handler().await);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            Arc::clone(&handler).run_cleanup_loop(Duration::from_millis(10), shutdown.clone()),
        );

        handler.put_data("books", tasks(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(handler.store().find_data("books", "a").await.unwrap().is_some());
    }
}
