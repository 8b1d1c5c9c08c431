//! Document store seam
//!
//! The DB handler only talks to storage through [`DocumentStore`]. Writes
//! arrive as batches of [`WriteOp`] per collection and are applied unordered:
//! each operation succeeds or fails on its own and failures are reported
//! back by index instead of aborting the batch.

use async_trait::async_trait;
use std::collections::HashSet;
use yyspider_common::protocol::{Document, TaskStatus};
use yyspider_common::Result;

use crate::stats::StatIncrement;

mod sqlite;

pub use sqlite::SqliteStore;

/// One buffered write against a collection
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a new task; fails if the id already exists
    InsertTask {
        id: String,
        status: TaskStatus,
        doc: Document,
    },
    /// Set a task's status
    UpdateStatus {
        id: String,
        status: TaskStatus,
        last_crawl_time: i64,
    },
    /// Insert or replace a scraped record
    UpsertData { id: String, doc: Document },
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::InsertTask { .. } => "insert_task",
            WriteOp::UpdateStatus { .. } => "update_status",
            WriteOp::UpsertData { .. } => "upsert_data",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::InsertTask { id, .. }
            | WriteOp::UpdateStatus { id, .. }
            | WriteOp::UpsertData { id, .. } => id,
        }
    }
}

/// A single rejected operation within a bulk write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    pub index: usize,
    pub message: String,
}

/// Outcome of an unordered bulk write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteReport {
    pub attempted: usize,
    pub errors: Vec<WriteError>,
}

impl BulkWriteReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.errors.len()
    }
}

/// Lease request as seen by the store
#[derive(Debug, Clone)]
pub struct LeaseRequest<'a> {
    pub coll_name: &'a str,
    pub count: u32,
    pub cond: &'a Document,
    /// Lease time written on the leased tasks (unix seconds)
    pub now: i64,
    /// CRAWLING tasks leased before this are eligible again
    pub stale_before: Option<i64>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Which of `ids` already exist as tasks in `coll_name`
    async fn existing_task_ids(&self, coll_name: &str, ids: &[String]) -> Result<HashSet<String>>;

    /// Atomically mark up to `count` eligible tasks CRAWLING and return them
    ///
    /// Two concurrent leases never return the same task.
    async fn lease_tasks(&self, request: LeaseRequest<'_>) -> Result<Vec<Document>>;

    /// Move CRAWLING tasks in `ids` to `status` and clear their lease
    ///
    /// Returns the number of tasks changed.
    async fn release_tasks(&self, coll_name: &str, ids: &[String], status: TaskStatus) -> Result<u64>;

    /// Apply `ops` unordered against `coll_name`
    async fn bulk_write(&self, coll_name: &str, ops: &[WriteOp]) -> Result<BulkWriteReport>;

    /// Add each increment to its counter row, creating rows as needed
    async fn increment_stats(&self, increments: &[StatIncrement]) -> Result<BulkWriteReport>;

    async fn find_task(&self, coll_name: &str, id: &str) -> Result<Option<Document>>;

    async fn find_data(&self, coll_name: &str, id: &str) -> Result<Option<Document>>;

    /// Current value of one counter row (0 if absent)
    async fn stat_count(&self, date: &str, coll_name: &str, event_type: &str) -> Result<i64>;
}
