//! Typed FIFO queue over a store list key.
//!
//! Entries cross the store as tagged JSON ([`QueueEntry`]), so a dequeuer
//! always knows whether it holds real work or the stop sentinel.

use crate::error::Result;
use crate::model::QueueEntry;
use crate::store::Store;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn Store>,
    key: String,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append an entry. Returns the new queue length.
    pub async fn push(&self, entry: &QueueEntry) -> Result<u64> {
        let wire = serde_json::to_string(entry)?;
        let len = self.store.push(&self.key, &wire).await?;
        self.record_op("push");
        Ok(len)
    }

    /// Non-blocking FIFO pop. `None` means the queue is empty.
    pub async fn pop(&self) -> Result<Option<QueueEntry>> {
        let entry = self.store.pop(&self.key).await?;
        self.record_op(if entry.is_some() { "pop" } else { "pop_empty" });
        entry.map(|wire| decode(&wire)).transpose()
    }

    /// Block until an entry is available or `timeout` elapses
    /// (`Duration::ZERO` = wait forever).
    pub async fn blocking_pop(&self, timeout: Duration) -> Result<Option<QueueEntry>> {
        let entry = self.store.blocking_pop(&self.key, timeout).await?;
        self.record_op(if entry.is_some() {
            "blocking_pop"
        } else {
            "blocking_pop_timeout"
        });
        entry.map(|wire| decode(&wire)).transpose()
    }

    pub async fn peek(&self) -> Result<Option<QueueEntry>> {
        let entry = self.store.peek(&self.key).await?;
        entry.map(|wire| decode(&wire)).transpose()
    }

    pub async fn len(&self) -> Result<u64> {
        self.store.len(&self.key).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&self.key).await?;
        self.record_op("clear");
        Ok(())
    }

    fn record_op(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.key.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

fn decode(wire: &str) -> Result<QueueEntry> {
    Ok(serde_json::from_str(wire)?)
}
