//! Daily event counters
//!
//! Increments are aggregated in memory and flushed by the cleanup cycle.
//! Every increment is counted twice: once for its collection and once for
//! the `"all"` aggregate.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;

/// Aggregate collection name for counters
pub const ALL_COLLECTIONS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatEvent {
    NewTask,
    CrawlSuccess,
    DataSaved,
}

impl StatEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatEvent::NewTask => "new_task",
            StatEvent::CrawlSuccess => "crawl_success",
            StatEvent::DataSaved => "data_saved",
        }
    }
}

impl fmt::Display for StatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending addition to one counter row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatIncrement {
    pub date: String,
    pub coll_name: String,
    pub event: StatEvent,
    pub amount: i64,
}

/// UTC calendar date used as the counter key
pub fn stat_date(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

type StatKey = (String, String, StatEvent);

#[derive(Debug, Default)]
pub struct StatsQueue {
    pending: Mutex<HashMap<StatKey, i64>>,
}

impl StatsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `amount` events for `coll_name` today
    pub async fn record(&self, coll_name: &str, event: StatEvent, amount: i64) {
        let date = stat_date(chrono::Utc::now());
        self.record_on(&date, coll_name, event, amount).await;
    }

    pub async fn record_on(&self, date: &str, coll_name: &str, event: StatEvent, amount: i64) {
        if amount == 0 {
            return;
        }

        let mut pending = self.pending.lock().await;
        for coll in [coll_name, ALL_COLLECTIONS] {
            *pending
                .entry((date.to_string(), coll.to_string(), event))
                .or_insert(0) += amount;
        }
    }

    /// Take every pending increment, leaving the queue empty
    pub async fn drain(&self) -> Vec<StatIncrement> {
        let pending = std::mem::take(&mut *self.pending.lock().await);

        let mut increments: Vec<StatIncrement> = pending
            .into_iter()
            .map(|((date, coll_name, event), amount)| StatIncrement {
                date,
                coll_name,
                event,
                amount,
            })
            .collect();
        increments.sort_by(|a, b| {
            (&a.date, &a.coll_name, a.event).cmp(&(&b.date, &b.coll_name, b.event))
        });
        increments
    }

    /// Number of distinct pending counter rows
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}
