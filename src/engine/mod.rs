//! Core engine. The public API for producing and working a logical queue.
//!
//! One `Engine` instance per process per queue name. The producer side
//! enqueues work and reads its own completed stream; the worker side
//! subscribes for work and completes each assignment. All coordination goes
//! through the shared store — engines on different machines never talk to
//! each other directly.

mod dispatch;
mod stats;
mod throttle;

pub use dispatch::{Assignment, Completer};
pub use stats::{ClusterStats, StatsSnapshot, StatsStream, StatsSummary};

use crate::error::Result;
use crate::keys;
use crate::model::{QueueEntry, WorkId, WorkItem};
use crate::store::{Channel, Store, WorkQueue, WorkingSet};
use dispatch::{DispatchContext, Router};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use throttle::Throttle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the completed stream re-checks the stopped flag while idle.
const DRAIN_TICK: Duration = Duration::from_millis(250);

/// Engine construction options.
pub struct EngineOptions {
    pub queue: String,
    /// Deadline for each dispatched item. `None` = unbounded.
    pub work_timeout: Option<Duration>,
    /// Max concurrently dispatched, uncompleted items per work
    /// subscription. 0 = unbounded.
    pub work_throttle: usize,
    /// Max undelivered completions buffered per completed-stream
    /// subscription.
    pub completed_throttle: usize,
    pub stats_interval: Duration,
}

impl EngineOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            work_timeout: None,
            work_throttle: 1,
            completed_throttle: 1,
            stats_interval: Duration::from_secs(1),
        }
    }

    pub fn work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout = Some(timeout);
        self
    }

    pub fn work_throttle(mut self, limit: usize) -> Self {
        self.work_throttle = limit;
        self
    }

    pub fn completed_throttle(mut self, limit: usize) -> Self {
        self.completed_throttle = limit;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

/// The queue engine. Owns per-instance throttle and stats state; shares the
/// pending queue, working set, and worker counter with every other engine
/// on the same queue name.
pub struct Engine {
    store: Arc<dyn Store>,
    queue: String,
    /// Unique per engine instance; fixes where completions route back to.
    instance_id: Uuid,
    work_timeout: Option<Duration>,
    completed_throttle: usize,
    pending: WorkQueue,
    working: WorkingSet,
    completed_key: String,
    worker_count_key: String,
    stopped: Arc<AtomicBool>,
    stats: Arc<stats::Counters>,
    stats_channel: Channel,
    work_limit: watch::Sender<usize>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, options: EngineOptions) -> Self {
        let instance_id = Uuid::new_v4();
        let queue = options.queue;
        let completed_key = keys::completed(&queue, &instance_id);
        let worker_count_key = keys::worker_count(&queue);
        let pending = WorkQueue::new(Arc::clone(&store), keys::pending(&queue));
        let working = WorkingSet::new(Arc::clone(&store), keys::working(&queue));
        let stats_channel = Channel::new(Arc::clone(&store), keys::stats_channel(&queue));
        let stats = Arc::new(stats::Counters::default());
        let (work_limit, _) = watch::channel(options.work_throttle);

        let heartbeat = spawn_heartbeat(
            Arc::clone(&stats),
            stats_channel.clone(),
            instance_id,
            options.stats_interval,
        );

        Self {
            store,
            queue,
            instance_id,
            work_timeout: options.work_timeout,
            completed_throttle: options.completed_throttle.max(1),
            pending,
            working,
            completed_key,
            worker_count_key,
            stopped: Arc::new(AtomicBool::new(false)),
            stats,
            stats_channel,
            work_limit,
            heartbeat,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Enqueue a payload for the workers of this queue. The completion will
    /// route back to this engine instance's completed stream.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<WorkId> {
        let item = WorkItem::new(payload, self.completed_key.clone());
        let id = item.id;
        self.pending.push(&QueueEntry::Work(item)).await?;
        self.stats.record_enqueued();
        debug!(queue = %self.queue, %id, "work enqueued");
        Ok(id)
    }

    /// Halt the queue's workers: push one stop sentinel per registered
    /// worker. One-shot; later calls are no-ops. Workers that subscribe
    /// after the worker-count snapshot will not receive a sentinel — finish
    /// worker registration before stopping.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let workers = self.store.counter(&self.worker_count_key).await?;
        info!(queue = %self.queue, workers, "stopping queue");
        for _ in 0..workers {
            self.pending.push(&QueueEntry::Stop).await?;
        }
        Ok(())
    }

    /// The stream of this instance's finished work, in arrival order.
    ///
    /// Infinite until `stop()` has been called; after that the stream drains
    /// the completed queue and ends on the first idle pass that finds it
    /// empty. Call `stop()` once the expected completions have been
    /// observed. Not restartable after completion.
    pub fn completed_stream(&self) -> CompletedStream {
        let (tx, rx) = mpsc::channel(self.completed_throttle);
        let queue = WorkQueue::new(Arc::clone(&self.store), self.completed_key.clone());
        let stopped = Arc::clone(&self.stopped);
        let task = tokio::spawn(run_completed(queue, stopped, tx));
        CompletedStream { rx, task }
    }

    /// Empty the pending queue and working set. Test setup only — not safe
    /// while workers are live.
    pub async fn clear(&self) -> Result<()> {
        self.pending.clear().await?;
        self.working.clear().await
    }

    pub async fn pending_len(&self) -> Result<u64> {
        self.pending.len().await
    }

    pub async fn working_count(&self) -> Result<u64> {
        self.working.count().await
    }

    // -----------------------------------------------------------------------
    // Worker side
    // -----------------------------------------------------------------------

    /// Subscribe for work. Registers this worker in the shared worker count
    /// (so `stop()` can size its sentinel burst), then dispatches under the
    /// work throttle until a sentinel or store error ends the stream.
    pub async fn work_stream(&self) -> Result<WorkStream> {
        // A stopped queue completes new subscriptions immediately.
        if self.stopped.load(Ordering::SeqCst) {
            let (_tx, rx) = mpsc::channel(1);
            return Ok(WorkStream { rx, task: None });
        }

        self.store.incr(&self.worker_count_key).await?;

        let throttle = Arc::new(Throttle::new());
        let router = Arc::new(Router {
            store: Arc::clone(&self.store),
            queue: self.queue.clone(),
            working: self.working.clone(),
            throttle: Arc::clone(&throttle),
            stats: Arc::clone(&self.stats),
        });
        let ctx = DispatchContext {
            store: Arc::clone(&self.store),
            queue: self.queue.clone(),
            pending: self.pending.clone(),
            working: self.working.clone(),
            worker_count_key: self.worker_count_key.clone(),
            work_timeout: self.work_timeout,
            router,
            throttle,
            limit: self.work_limit.subscribe(),
        };

        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(dispatch::run_dispatch(ctx, tx));
        Ok(WorkStream {
            rx,
            task: Some(task),
        })
    }

    /// Adjust the live work-dispatch concurrency bound for every work
    /// subscription of this engine instance. 0 = unbounded.
    pub fn set_work_throttle(&self, limit: usize) {
        self.work_limit.send_replace(limit);
    }

    /// Drive a work stream with an async handler, one spawned task per
    /// assignment. A handler panic becomes a failed completion instead of a
    /// stuck in-flight item; handler errors are routed as completed-with-
    /// error records. Returns when the stream completes (stop sentinel) or
    /// fails (store error).
    pub async fn serve<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, String>> + Send + 'static,
    {
        let mut stream = self.work_stream().await?;
        while let Some(next) = stream.recv().await {
            let Assignment { payload, completer } = next?;
            let handler = handler.clone();
            tokio::spawn(async move {
                let outcome = tokio::spawn(handler(payload)).await;
                let routed = match outcome {
                    Ok(Ok(value)) => completer.complete(value).await,
                    Ok(Err(e)) => completer.fail(e).await,
                    Err(join_error) => completer.fail(format!("worker panic: {join_error}")).await,
                };
                if let Err(e) = routed {
                    error!("completion delivery failed: {e}");
                }
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Cluster-wide stats, merged from every engine heartbeating on this
    /// queue's stats channel, emitted every `period`.
    pub async fn stats_stream(&self, period: Duration) -> Result<StatsStream> {
        let subscription = self.stats_channel.subscribe().await?;
        Ok(stats::spawn_aggregator(subscription, period))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Worker-side stream of assignments. Dropping it cancels the dispatch loop
/// and releases its blocking store wait.
pub struct WorkStream {
    rx: mpsc::Receiver<Result<Assignment>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WorkStream {
    /// Next assignment; `None` once the stream has completed, `Some(Err)`
    /// exactly once if the subscription failed on a store error.
    pub async fn recv(&mut self) -> Option<Result<Assignment>> {
        self.rx.recv().await
    }
}

impl Drop for WorkStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Producer-side stream of finished work items. Dropping it cancels the
/// drain loop and releases its blocking store wait.
pub struct CompletedStream {
    rx: mpsc::Receiver<Result<WorkItem>>,
    task: tokio::task::JoinHandle<()>,
}

impl CompletedStream {
    pub async fn recv(&mut self) -> Option<Result<WorkItem>> {
        self.rx.recv().await
    }
}

impl Drop for CompletedStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_completed(
    queue: WorkQueue,
    stopped: Arc<AtomicBool>,
    tx: mpsc::Sender<Result<WorkItem>>,
) {
    loop {
        let entry = if stopped.load(Ordering::SeqCst) {
            // Draining: deliver whatever is queued, end when empty.
            match queue.pop().await {
                Ok(Some(entry)) => Some(entry),
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        } else {
            match queue.blocking_pop(DRAIN_TICK).await {
                Ok(entry) => entry,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        };

        match entry {
            Some(QueueEntry::Work(item)) => {
                if tx.send(Ok(item)).await.is_err() {
                    return;
                }
            }
            Some(QueueEntry::Stop) => {
                warn!(queue = %queue.key(), "stop sentinel on a completed queue, skipping");
            }
            // Idle heartbeat: loop re-checks the stopped flag.
            None => {}
        }
    }
}

fn spawn_heartbeat(
    stats: Arc<stats::Counters>,
    channel: Channel,
    instance_id: Uuid,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = stats.snapshot(instance_id, &host);
            let Ok(value) = serde_json::to_value(&snapshot) else {
                continue;
            };
            if let Err(e) = channel.send(&value).await {
                debug!("stats heartbeat publish failed: {e}");
            }
        }
    })
}
