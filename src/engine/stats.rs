//! Engine counters, heartbeat snapshots, and cluster-wide aggregation.
//!
//! Peripheral bookkeeping: every engine instance broadcasts its counters on
//! the queue's stats channel at a fixed interval, and any subscriber can
//! merge those snapshots into a cluster view. None of this sits on the
//! correctness path.

use crate::model::WorkItem;
use crate::store::ChannelSubscription;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One engine instance's counters at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub worker_id: Uuid,
    pub host: String,
    pub pending_count: i64,
    pub completed_count: u64,
    pub error_count: u64,
    pub avg_work_time_ms: f64,
    pub completed_bytes: u64,
    pub last_error: Option<String>,
}

/// Live counters, bumped by `enqueue` and the completion router.
#[derive(Default)]
pub(crate) struct Counters {
    pending: AtomicI64,
    completed: AtomicU64,
    errors: AtomicU64,
    work_time_ms: AtomicU64,
    completed_bytes: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Counters {
    pub fn record_enqueued(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self, item: &WorkItem) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(ms) = item.work_time_ms() {
            self.work_time_ms.fetch_add(ms, Ordering::Relaxed);
        }
        match &item.error {
            Some(error) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock().unwrap() = Some(error.clone());
            }
            None => {
                let bytes = serde_json::to_string(item).map_or(0, |wire| wire.len() as u64);
                self.completed_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self, worker_id: Uuid, host: &str) -> StatsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let work_time_ms = self.work_time_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            worker_id,
            host: host.to_string(),
            pending_count: self.pending.load(Ordering::Relaxed),
            completed_count: completed,
            error_count: self.errors.load(Ordering::Relaxed),
            avg_work_time_ms: if completed > 0 {
                work_time_ms as f64 / completed as f64
            } else {
                0.0
            },
            completed_bytes: self.completed_bytes.load(Ordering::Relaxed),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}

/// Totals derived across every worker seen on the stats channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub total_pending: i64,
    pub total_completed: u64,
    pub total_errors: u64,
    pub total_error_rate: f64,
    pub total_completed_bytes: u64,
    pub avg_work_time_ms: f64,
}

/// Merged cluster view: latest snapshot per worker plus derived totals.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub workers: HashMap<Uuid, StatsSnapshot>,
    pub summary: StatsSummary,
}

impl ClusterStats {
    fn from_workers(workers: HashMap<Uuid, StatsSnapshot>) -> Self {
        let mut summary = StatsSummary::default();
        let mut work_time_ms = 0.0;
        for snapshot in workers.values() {
            summary.total_pending += snapshot.pending_count;
            summary.total_completed += snapshot.completed_count;
            summary.total_errors += snapshot.error_count;
            summary.total_completed_bytes += snapshot.completed_bytes;
            work_time_ms += snapshot.avg_work_time_ms * snapshot.completed_count as f64;
        }
        if summary.total_completed > 0 {
            summary.total_error_rate =
                summary.total_errors as f64 / summary.total_completed as f64;
            summary.avg_work_time_ms = work_time_ms / summary.total_completed as f64;
        }
        Self { workers, summary }
    }
}

/// Periodic cluster-stats emissions. Dropping the stream unsubscribes.
pub struct StatsStream {
    rx: mpsc::Receiver<ClusterStats>,
    task: tokio::task::JoinHandle<()>,
}

impl StatsStream {
    pub async fn recv(&mut self) -> Option<ClusterStats> {
        self.rx.recv().await
    }
}

impl Drop for StatsStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_aggregator(
    mut subscription: ChannelSubscription,
    period: Duration,
) -> StatsStream {
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        let mut workers: HashMap<Uuid, StatsSnapshot> = HashMap::new();
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(value) => match serde_json::from_value::<StatsSnapshot>(value) {
                        Ok(snapshot) => {
                            workers.insert(snapshot.worker_id, snapshot);
                        }
                        Err(e) => debug!("unreadable stats heartbeat: {e}"),
                    },
                    // Stats channel closed — emit nothing further.
                    None => return,
                },
                _ = ticker.tick() => {
                    let stats = ClusterStats::from_workers(workers.clone());
                    if tx.send(stats).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    StatsStream { rx, task }
}
