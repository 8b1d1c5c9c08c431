//! Per-collection pending write buffers

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::store::WriteOp;

pub type CollectionQueue = Arc<Mutex<Vec<WriteOp>>>;

#[derive(Debug, Default)]
pub struct WriteQueues {
    queues: RwLock<HashMap<String, CollectionQueue>>,
}

impl WriteQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `coll_name`, created on first use
    pub async fn queue(&self, coll_name: &str) -> CollectionQueue {
        if let Some(queue) = self.queues.read().await.get(coll_name) {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write().await;
        Arc::clone(queues.entry(coll_name.to_string()).or_default())
    }

    pub async fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pending operation count per collection
    pub async fn depths(&self) -> BTreeMap<String, usize> {
        let queues: Vec<(String, CollectionQueue)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(name, queue)| (name.clone(), Arc::clone(queue)))
            .collect();

        let mut depths = BTreeMap::new();
        for (name, queue) in queues {
            depths.insert(name, queue.lock().await.len());
        }
        depths
    }
}

/// Ids of task inserts already waiting in `ops`
pub fn pending_task_ids(ops: &[WriteOp]) -> HashSet<&str> {
    ops.iter()
        .filter_map(|op| match op {
            WriteOp::InsertTask { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect()
}
