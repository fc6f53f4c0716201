//! In-flight tracking set over a store hash key.
//!
//! Items enter the set when a worker dequeues them and leave exactly once,
//! whichever completion event wins. The removal count from
//! [`WorkingSet::remove_and_fetch`] is the engine's duplicate detector.

use crate::error::Result;
use crate::model::{WorkId, WorkItem};
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkingSet {
    store: Arc<dyn Store>,
    key: String,
}

impl WorkingSet {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Track `item` as dispatched. Called before the item reaches user code.
    pub async fn add(&self, item: &WorkItem) -> Result<()> {
        let wire = serde_json::to_string(item)?;
        self.store
            .hash_set(&self.key, &item.id.0.to_string(), &wire)
            .await
    }

    /// Atomic remove-and-fetch. Exactly one concurrent caller for a given id
    /// observes a removal count of 1; late callers see 0 and must treat the
    /// completion as a duplicate.
    pub async fn remove_and_fetch(&self, id: WorkId) -> Result<(u64, Option<WorkItem>)> {
        let (removed, wire) = self.store.hash_remove(&self.key, &id.0.to_string()).await?;
        let item = wire.map(|wire| serde_json::from_str(&wire)).transpose()?;
        Ok((removed, item))
    }

    pub async fn count(&self) -> Result<u64> {
        self.store.hash_len(&self.key).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&self.key).await
    }
}
