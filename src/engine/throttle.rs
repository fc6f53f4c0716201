//! Concurrency bound for one subscription's scheduling loop.
//!
//! A counter, not a thread pool: the dispatch loop acquires a slot before
//! each dequeue, and the completion router releases it, re-triggering the
//! loop. The limit itself is live — `Engine::set_work_throttle` publishes a
//! new bound through a watch channel and parked loops re-evaluate.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, watch};

pub(crate) struct Throttle {
    in_flight: AtomicUsize,
    freed: Notify,
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            freed: Notify::new(),
        }
    }

    /// Wait until `in_flight < limit`, then take a slot. A limit of 0 means
    /// unbounded. Only the owning scheduling loop calls this, so the
    /// check-then-increment is race-free.
    pub async fn acquire(&self, limit: &mut watch::Receiver<usize>) {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            // Register before checking so a release between the check and
            // the wait still wakes us.
            freed.as_mut().enable();

            let bound = *limit.borrow();
            if bound == 0 || self.in_flight.load(Ordering::Acquire) < bound {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return;
            }

            tokio::select! {
                _ = &mut freed => {}
                changed = limit.changed() => {
                    if changed.is_err() {
                        // Limit publisher is gone; only completions can
                        // free a slot now.
                        self.freed.notified().await;
                    }
                }
            }
        }
    }

    /// Free a slot and re-trigger the scheduling loop.
    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.freed.notify_one();
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}
