//! Worker-side dispatch: assignments, the completion path, and the timeout
//! guard.
//!
//! The dispatch loop is self-scheduling: it takes a throttle slot, pops the
//! pending queue, registers the item in the working set, and hands the
//! payload to user code with a [`Completer`]. Whichever completion event
//! arrives first — the worker's callback or the timeout guard — routes the
//! finished record home and frees the slot for the next dequeue.

use crate::engine::stats::Counters;
use crate::engine::throttle::Throttle;
use crate::error::Result;
use crate::model::{QueueEntry, TIMEOUT_ERROR, WorkItem};
use crate::store::{Store, WorkQueue, WorkingSet};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

/// One unit of work handed to user code. `complete` (or `fail`) must be
/// invoked exactly once by convention; extra invocations are silently
/// ignored.
pub struct Assignment {
    pub payload: serde_json::Value,
    pub completer: Completer,
}

/// Completion callback for a dispatched item.
///
/// Idempotent at two layers: a local first-wins flag covers races inside
/// this dispatch (worker callback vs. timeout guard), and the working-set
/// removal count covers everything else (redelivery after a crash, another
/// process's late completion).
#[derive(Clone)]
pub struct Completer {
    inner: Arc<CompleterInner>,
}

struct CompleterInner {
    item: std::sync::Mutex<Option<WorkItem>>,
    fired: AtomicBool,
    done: Notify,
    router: Arc<Router>,
}

impl Completer {
    pub(crate) fn new(item: WorkItem, router: Arc<Router>) -> Self {
        Self {
            inner: Arc::new(CompleterInner {
                item: std::sync::Mutex::new(Some(item)),
                fired: AtomicBool::new(false),
                done: Notify::new(),
                router,
            }),
        }
    }

    pub(crate) fn payload(&self) -> serde_json::Value {
        let item = self.inner.item.lock().unwrap();
        item.as_ref()
            .map(|item| item.payload.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    /// Arm the deadline timer. If it fires before a real completion, a
    /// synthesized `timeout` error completion runs through the normal
    /// routing path; if the real completion wins, the timer is cancelled.
    pub(crate) fn arm_deadline(&self, deadline: Duration) {
        let completer = self.clone();
        tokio::spawn(async move {
            let expired = tokio::select! {
                _ = completer.inner.done.notified() => false,
                _ = tokio::time::sleep(deadline) => true,
            };
            if expired {
                if let Err(e) = completer.finish(Err(TIMEOUT_ERROR.to_string())).await {
                    error!("timeout completion failed to route: {e}");
                }
            }
        });
    }

    /// Report successful completion with a result value.
    pub async fn complete(&self, result: serde_json::Value) -> Result<()> {
        self.finish(Ok(result)).await
    }

    /// Report failed completion with an error value.
    pub async fn fail(&self, error: impl Into<String>) -> Result<()> {
        self.finish(Err(error.into())).await
    }

    async fn finish(&self, outcome: std::result::Result<serde_json::Value, String>) -> Result<()> {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            debug!("completion already recorded for this dispatch, ignoring");
            return Ok(());
        }
        self.inner.done.notify_waiters();

        let Some(mut item) = self.inner.item.lock().unwrap().take() else {
            return Ok(());
        };
        item.mark_finished(outcome);
        self.inner.router.route(item).await
    }
}

/// Routes completion events: evicts the item from the working set, delivers
/// the finished record to its producer, and re-triggers the dispatch loop.
pub(crate) struct Router {
    pub store: Arc<dyn Store>,
    pub queue: String,
    pub working: WorkingSet,
    pub throttle: Arc<Throttle>,
    pub stats: Arc<Counters>,
}

impl Router {
    async fn route(&self, item: WorkItem) -> Result<()> {
        let (removed, _) = self.working.remove_and_fetch(item.id).await?;
        if removed == 0 {
            // Someone else already won this id — late timeout, redelivered
            // item, or a second process. No side effects.
            metrics::duplicate_completions()
                .add(1, &[KeyValue::new("queue", self.queue.clone())]);
            debug!(queue = %self.queue, id = %item.id, "late or duplicate completion dropped");
            return Ok(());
        }

        self.stats.record_finished(&item);
        let outcome = match item.error.as_deref() {
            Some(TIMEOUT_ERROR) => "timeout",
            Some(_) => "error",
            None => "completed",
        };
        metrics::work_completed().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
        if let Some(ms) = item.work_time_ms() {
            metrics::work_duration_ms()
                .record(ms as f64, &[KeyValue::new("queue", self.queue.clone())]);
        }

        // The completed queue is the correctness backstop; the channel
        // signal only wakes listeners that would otherwise poll.
        let destination = item.result_destination.clone();
        let id = item.id;
        let delivery: Result<()> = async {
            WorkQueue::new(self.store.clone(), destination.clone())
                .push(&QueueEntry::Work(item))
                .await?;
            self.store.publish(&destination, "completed").await?;
            Ok(())
        }
        .await;

        // The slot frees either way: a failed delivery is reported to the
        // completing caller, not allowed to stall the dispatch loop.
        self.throttle.release();
        if let Err(ref e) = delivery {
            error!(queue = %self.queue, %id, "completed delivery failed: {e}");
        }
        delivery
    }
}

/// Everything one dispatch loop needs.
pub(crate) struct DispatchContext {
    pub store: Arc<dyn Store>,
    pub queue: String,
    pub pending: WorkQueue,
    pub working: WorkingSet,
    pub worker_count_key: String,
    pub work_timeout: Option<Duration>,
    pub router: Arc<Router>,
    pub throttle: Arc<Throttle>,
    pub limit: watch::Receiver<usize>,
}

/// The per-subscription scheduling loop. Runs until a stop sentinel, a
/// store error, or subscriber drop.
pub(crate) async fn run_dispatch(
    mut ctx: DispatchContext,
    tx: mpsc::Sender<Result<Assignment>>,
) {
    loop {
        ctx.throttle.acquire(&mut ctx.limit).await;

        let entry = match ctx.pending.blocking_pop(Duration::ZERO).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                ctx.throttle.release();
                continue;
            }
            Err(e) => {
                error!(queue = %ctx.queue, "work dequeue failed: {e}");
                ctx.throttle.release();
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        match entry {
            QueueEntry::Stop => {
                ctx.throttle.release();
                if let Err(e) = ctx.store.decr(&ctx.worker_count_key).await {
                    warn!(queue = %ctx.queue, "worker-count decrement failed: {e}");
                }
                info!(queue = %ctx.queue, "stop sentinel received, completing work stream");
                return;
            }
            QueueEntry::Work(mut item) => {
                item.mark_started();
                // Into the working set before user code ever sees it.
                if let Err(e) = ctx.working.add(&item).await {
                    error!(queue = %ctx.queue, id = %item.id, "working-set add failed: {e}");
                    ctx.throttle.release();
                    let _ = tx.send(Err(e)).await;
                    return;
                }

                metrics::work_dispatched()
                    .add(1, &[KeyValue::new("queue", ctx.queue.clone())]);

                let completer = Completer::new(item, Arc::clone(&ctx.router));
                if let Some(deadline) = ctx.work_timeout {
                    completer.arm_deadline(deadline);
                }
                let assignment = Assignment {
                    payload: completer.payload(),
                    completer,
                };
                if tx.send(Ok(assignment)).await.is_err() {
                    // Subscriber dropped mid-dispatch. The item stays in the
                    // working set; the timeout guard (if armed) will route it.
                    return;
                }
            }
        }
    }
}
