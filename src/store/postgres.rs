//! Postgres-backed store via direct SQLx.
//!
//! Lists, hashes, and counters map to three tables (see `migrations/`).
//! Blocking pops and pub/sub ride on LISTEN/NOTIFY with a poll fallback, so
//! a lost notification degrades to latency, never to a hang. Every blocking
//! call takes its own `PgListener` connection; pool queries are never
//! stalled behind a waiter.

use crate::error::{Error, Result};
use crate::store::{Store, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// NOTIFY channel fired on every list push; payload is the list key.
const LIST_EVENTS: &str = "relayq_lists";

/// NOTIFY channel carrying pub/sub envelopes for all logical channels.
const PUBSUB_EVENTS: &str = "relayq_pubsub";

/// Pub/sub messages are routed by logical channel name inside a single
/// Postgres NOTIFY channel.
#[derive(Serialize, Deserialize)]
struct Envelope {
    channel: String,
    message: String,
}

pub struct PgStore {
    pool: PgPool,
    /// Fallback re-check interval for blocking waits when no NOTIFY arrives.
    poll_interval: Duration,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            poll_interval: Duration::from_secs(5),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }
}

#[async_trait]
impl Store for PgStore {
    async fn push(&self, key: &str, value: &str) -> Result<u64> {
        // NOTIFY is transactional — waiters only wake once the row is visible.
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO relayq_lists (key, value) VALUES ($1, $2)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        let (len,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relayq_lists WHERE key = $1")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(LIST_EVENTS)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(len as u64)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>> {
        // SKIP LOCKED keeps racing workers from double-popping one entry.
        let value: Option<String> = sqlx::query_scalar(
            "DELETE FROM relayq_lists
             WHERE ctid = (
                 SELECT ctid FROM relayq_lists
                 WHERE key = $1
                 ORDER BY seq
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING value",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (timeout > Duration::ZERO).then(|| Instant::now() + timeout);

        // Dedicated connection for the wait; dropping this future drops the
        // listener and releases it.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(LIST_EVENTS).await?;

        loop {
            if let Some(value) = self.pop(key).await? {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    tokio::select! {
                        _ = listener.recv() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = tokio::time::sleep_until(deadline) => return Ok(None),
                    }
                }
                None => {
                    tokio::select! {
                        _ = listener.recv() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM relayq_lists WHERE key = $1 ORDER BY seq LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let (len,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relayq_lists WHERE key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(len as u64)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM relayq_lists WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relayq_hashes WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relayq_counters WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO relayq_hashes (key, field, value) VALUES ($1, $2, $3)
             ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<(u64, Option<String>)> {
        // A single DELETE ... RETURNING: exactly one concurrent caller gets
        // the row, everyone else sees zero rows affected.
        let value: Option<String> = sqlx::query_scalar(
            "DELETE FROM relayq_hashes WHERE key = $1 AND field = $2 RETURNING value",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;
        match value {
            Some(value) => Ok((1, Some(value))),
            None => Ok((0, None)),
        }
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        let (len,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relayq_hashes WHERE key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(len as u64)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let (value,): (i64,) = sqlx::query_as(
            "INSERT INTO relayq_counters (key, value) VALUES ($1, 1)
             ON CONFLICT (key) DO UPDATE SET value = relayq_counters.value + 1
             RETURNING value",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let (value,): (i64,) = sqlx::query_as(
            "INSERT INTO relayq_counters (key, value) VALUES ($1, -1)
             ON CONFLICT (key) DO UPDATE SET value = relayq_counters.value - 1
             RETURNING value",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM relayq_counters WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let envelope = serde_json::to_string(&Envelope {
            channel: channel.to_string(),
            message: message.to_string(),
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PUBSUB_EVENTS)
            .bind(&envelope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(PUBSUB_EVENTS).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Ok(envelope) =
                            serde_json::from_str::<Envelope>(notification.payload())
                        else {
                            continue;
                        };
                        if envelope.channel == channel && tx.send(envelope.message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel, "pub/sub listener lost: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(rx, Some(forwarder)))
    }
}
