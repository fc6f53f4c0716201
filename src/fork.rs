//! Fan a stream of payloads out over a queue's workers.
//!
//! `fork_many` projects an upstream sequence onto the distributed queue:
//! every upstream value is enqueued as it arrives, and the returned handle
//! yields the queue's completed records in arrival order. Downstream sees
//! finished work, not raw payloads.

use crate::engine::Engine;
use crate::error::Result;
use crate::model::WorkItem;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

/// Completed records spliced in for the forked upstream. Dropping the
/// handle disposes both the upstream driver and the completed-stream
/// subscription.
pub struct ForkMany {
    completed: crate::engine::CompletedStream,
    driver: tokio::task::JoinHandle<()>,
}

impl ForkMany {
    pub async fn recv(&mut self) -> Option<Result<WorkItem>> {
        self.completed.recv().await
    }
}

impl Drop for ForkMany {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Enqueue every value pulled from `upstream` on the engine's queue and
/// return its completed stream.
pub fn fork_many(mut upstream: mpsc::Receiver<serde_json::Value>, engine: Arc<Engine>) -> ForkMany {
    let completed = engine.completed_stream();
    let driver = tokio::spawn(async move {
        while let Some(payload) = upstream.recv().await {
            if let Err(e) = engine.enqueue(payload).await {
                error!(queue = %engine.queue(), "fork_many enqueue failed: {e}");
                return;
            }
        }
    });
    ForkMany { completed, driver }
}
