//! Shared-store abstraction.
//!
//! The pending queue, working set, worker counter, and pub/sub channels all
//! live in an external store shared by every producer and worker process.
//! This module defines the contract the engine needs from that store, plus
//! the typed adapters ([`WorkQueue`], [`WorkingSet`], [`Channel`]) built on
//! top of it.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! single-process deployments, and [`PgStore`] backed by Postgres.

mod channel;
mod memory;
mod postgres;
mod queue;
mod set;

pub use channel::{Channel, ChannelSubscription};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use queue::WorkQueue;
pub use set::WorkingSet;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Contract for the shared external store.
///
/// Lists are FIFO per single pusher; hashes and counters are atomic per
/// operation. No guarantee is made across racing callers beyond that
/// single-operation atomicity — the engine's correctness rests on exactly
/// two atomic facts: one worker pops a given entry, and one caller wins
/// [`Store::hash_remove`] for a given field.
#[async_trait]
pub trait Store: Send + Sync {
    // --- FIFO lists ---

    /// Append to the list at `key`. Returns the new length.
    async fn push(&self, key: &str, value: &str) -> Result<u64>;

    /// Non-blocking FIFO pop. `None` is a valid, non-error result.
    async fn pop(&self, key: &str) -> Result<Option<String>>;

    /// Block until an entry is available or `timeout` elapses.
    /// `Duration::ZERO` waits forever. Implementations must not stall
    /// concurrent non-blocking operations on the same key — connection-
    /// oriented backends dedicate a connection to each blocking call.
    /// Dropping the returned future releases the wait (and the connection).
    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// First entry without removing it.
    async fn peek(&self, key: &str) -> Result<Option<String>>;

    async fn len(&self, key: &str) -> Result<u64>;

    /// Delete `key` entirely (list, hash, or counter).
    async fn delete(&self, key: &str) -> Result<()>;

    // --- Hashes ---

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Atomic remove-and-fetch. Returns how many entries were removed
    /// (0 or 1) and the removed value. Under concurrent removals of the
    /// same field, exactly one caller observes a count of 1.
    async fn hash_remove(&self, key: &str, field: &str) -> Result<(u64, Option<String>)>;

    async fn hash_len(&self, key: &str) -> Result<u64>;

    // --- Counters ---

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn decr(&self, key: &str) -> Result<i64>;

    async fn counter(&self, key: &str) -> Result<i64>;

    // --- Pub/sub ---

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to `channel`. The subscription is an infinite,
    /// non-restartable sequence of messages until dropped.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// A live pub/sub subscription. Dropping it tears down the feed.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<String>,
        forwarder: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { rx, forwarder }
    }

    /// Next message, or `None` once the feed is torn down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}
