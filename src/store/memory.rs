//! In-process store for tests and single-process deployments.
//!
//! Everything lives behind one mutex; blocking pops park on a per-key
//! [`Notify`] so pushers wake exactly one waiter per entry.

use crate::error::Result;
use crate::store::{Store, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    counters: HashMap<String, i64>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// Shared in-memory store. Cheap to clone via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// One wakeup source per list key, created on demand.
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, key: &str) -> Arc<Notify> {
        let mut signals = self.signals.lock().unwrap();
        signals
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn pop_front(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.lists.get_mut(key).and_then(|list| list.pop_front())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, key: &str, value: &str) -> Result<u64> {
        let len = {
            let mut inner = self.inner.lock().unwrap();
            let list = inner.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_string());
            list.len() as u64
        };
        // One wakeup per entry; a stored permit covers the no-waiter case.
        self.signal(key).notify_one();
        Ok(len)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>> {
        Ok(self.pop_front(key))
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (timeout > Duration::ZERO).then(|| Instant::now() + timeout);
        let notify = self.signal(key);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before checking the list so a push between the check
            // and the wait still wakes us.
            notified.as_mut().enable();

            if let Some(value) = self.pop_front(key) {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => return Ok(None),
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .lists
            .get(key)
            .and_then(|list| list.front())
            .cloned())
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.lists.remove(key);
        inner.hashes.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<(u64, Option<String>)> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .hashes
            .get_mut(key)
            .and_then(|hash| hash.remove(field));
        match removed {
            Some(value) => Ok((1, Some(value))),
            None => Ok((0, None)),
        }
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).map_or(0, |hash| hash.len() as u64))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.counters.entry(key.to_string()).or_insert(0);
        *value -= 1;
        Ok(*value)
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.counters.get(key).copied().unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(senders) = inner.subscribers.get_mut(channel) {
            // Prune dropped subscribers while fanning out.
            senders.retain(|tx| tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx, None))
    }
}
