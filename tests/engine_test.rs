//! Integration tests for the queue engine: dispatch, completion routing,
//! throttling, timeouts, fan-out, and the stop protocol — all over the
//! in-memory store.

use relayq::engine::{Assignment, Engine, EngineOptions};
use relayq::model::{Status, TIMEOUT_ERROR, WorkItem};
use relayq::store::{MemoryStore, Store};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

const TEST_DEADLINE: Duration = Duration::from_secs(10);

fn test_engine(options: EngineOptions) -> (Arc<Engine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new(store.clone(), options));
    (engine, store)
}

/// Spawn a worker that completes every assignment with `payload + 1`.
fn spawn_incrementing_worker(engine: Arc<Engine>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut work = engine.work_stream().await.unwrap();
        let mut handled = 0;
        while let Some(next) = work.recv().await {
            let Assignment { payload, completer } = next.unwrap();
            let n = payload.as_i64().unwrap();
            completer.complete(json!(n + 1)).await.unwrap();
            handled += 1;
        }
        handled
    })
}

async fn collect_completed(
    stream: &mut relayq::engine::CompletedStream,
    count: usize,
) -> Vec<WorkItem> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let item = timeout(TEST_DEADLINE, stream.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("completed stream ended early")
            .expect("completed stream errored");
        records.push(item);
    }
    records
}

// ---------------------------------------------------------------------------
// Scenario A — enqueue, work, route home, stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completes_all_work_with_correct_results() {
    let (engine, _) = test_engine(EngineOptions::new("scenario-a"));

    for n in [1, 2, 3] {
        engine.enqueue(json!(n)).await.unwrap();
    }

    let worker = spawn_incrementing_worker(Arc::clone(&engine));

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 3).await;

    for record in &records {
        assert_eq!(record.status, Status::Completed);
        assert!(record.error.is_none());
        let sent = record.payload.as_i64().unwrap();
        let got = record.completed_payload.as_ref().unwrap().as_i64().unwrap();
        assert_eq!(got, sent + 1);
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
    }

    // All three distinct payloads came back, in some order.
    let mut sent: Vec<i64> = records.iter().map(|r| r.payload.as_i64().unwrap()).collect();
    sent.sort_unstable();
    assert_eq!(sent, vec![1, 2, 3]);

    engine.stop().await.unwrap();
    // Drained: the stream completes, the worker sees its sentinel.
    assert!(
        timeout(TEST_DEADLINE, completed.recv())
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(timeout(TEST_DEADLINE, worker).await.unwrap().unwrap(), 3);
}

#[tokio::test]
async fn handles_work_enqueued_before_any_subscription() {
    let (engine, _) = test_engine(EngineOptions::new("pre-queued"));

    for n in 0..5 {
        engine.enqueue(json!(n)).await.unwrap();
    }
    assert_eq!(engine.pending_len().await.unwrap(), 5);

    let worker = spawn_incrementing_worker(Arc::clone(&engine));
    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 5).await;
    assert_eq!(records.len(), 5);

    engine.stop().await.unwrap();
    assert_eq!(timeout(TEST_DEADLINE, worker).await.unwrap().unwrap(), 5);
}

// ---------------------------------------------------------------------------
// P2 — idempotent completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_complete_calls_keep_only_the_first_result() {
    let (engine, _) = test_engine(EngineOptions::new("idempotent"));

    engine.enqueue(json!(7)).await.unwrap();

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut work = engine.work_stream().await.unwrap();
            while let Some(next) = work.recv().await {
                let Assignment { completer, .. } = next.unwrap();
                completer.complete(json!("first")).await.unwrap();
                // Extra invocations must be silently ignored.
                completer.complete(json!("second")).await.unwrap();
                completer.fail("ug!").await.unwrap();
            }
        })
    };

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 1).await;
    assert_eq!(records[0].completed_payload, Some(json!("first")));
    assert_eq!(records[0].status, Status::Completed);
    assert!(records[0].error.is_none());

    engine.stop().await.unwrap();
    // Exactly one record ever reaches the completed queue.
    assert!(
        timeout(TEST_DEADLINE, completed.recv())
            .await
            .unwrap()
            .is_none()
    );
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
    assert_eq!(engine.working_count().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// P3 / Scenario B — throttle bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_never_exceeds_the_throttle() {
    let (engine, _) = test_engine(EngineOptions::new("throttled").work_throttle(1));

    for n in 0..5 {
        engine.enqueue(json!(n)).await.unwrap();
    }

    let outstanding = Arc::new(AtomicUsize::new(0));
    let max_outstanding = Arc::new(AtomicUsize::new(0));

    let worker = {
        let engine = Arc::clone(&engine);
        let outstanding = Arc::clone(&outstanding);
        let max_outstanding = Arc::clone(&max_outstanding);
        tokio::spawn(async move {
            let mut work = engine.work_stream().await.unwrap();
            while let Some(next) = work.recv().await {
                let Assignment { payload, completer } = next.unwrap();
                let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                max_outstanding.fetch_max(now, Ordering::SeqCst);

                let outstanding = Arc::clone(&outstanding);
                tokio::spawn(async move {
                    // Make the work take long enough that a second dispatch
                    // would overlap if the throttle leaked.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    completer.complete(payload).await.unwrap();
                });
            }
        })
    };

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 5).await;
    assert_eq!(records.len(), 5);
    assert_eq!(max_outstanding.load(Ordering::SeqCst), 1);

    engine.stop().await.unwrap();
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn raising_the_throttle_mid_run_takes_effect() {
    let (engine, _) = test_engine(EngineOptions::new("resized").work_throttle(1));

    for n in 0..6 {
        engine.enqueue(json!(n)).await.unwrap();
    }
    engine.set_work_throttle(3);

    let worker = spawn_incrementing_worker(Arc::clone(&engine));
    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 6).await;
    assert_eq!(records.len(), 6);

    engine.stop().await.unwrap();
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// P4 / Scenario C — timeout guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_work_is_completed_with_a_timeout_error() {
    let (engine, _) = test_engine(
        EngineOptions::new("deadlines").work_timeout(Duration::from_millis(50)),
    );

    for n in 0..2 {
        engine.enqueue(json!(n)).await.unwrap();
    }

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut work = engine.work_stream().await.unwrap();
            while let Some(next) = work.recv().await {
                let Assignment { payload, completer } = next.unwrap();
                tokio::spawn(async move {
                    // Well past the deadline; the guard fires first and the
                    // late real completion must be dropped.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    completer.complete(payload).await.unwrap();
                });
            }
        })
    };

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 2).await;
    for record in &records {
        assert_eq!(record.status, Status::Error);
        assert_eq!(record.error.as_deref(), Some(TIMEOUT_ERROR));
        assert!(record.completed_payload.is_none());
    }

    // Give the late completions a chance to (wrongly) surface.
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.stop().await.unwrap();
    assert!(
        timeout(TEST_DEADLINE, completed.recv())
            .await
            .unwrap()
            .is_none()
    );
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn fast_work_is_not_marked_timed_out() {
    let (engine, _) = test_engine(
        EngineOptions::new("fast-lane").work_timeout(Duration::from_millis(100)),
    );

    engine.enqueue(json!(1)).await.unwrap();
    let worker = spawn_incrementing_worker(Arc::clone(&engine));

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 1).await;
    assert_eq!(records[0].status, Status::Completed);
    assert!(records[0].error.is_none());

    // Outlive the deadline: the cancelled timer must not produce a second,
    // timed-out record.
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.stop().await.unwrap();
    assert!(
        timeout(TEST_DEADLINE, completed.recv())
            .await
            .unwrap()
            .is_none()
    );
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Worker errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_errors_are_routed_as_data() {
    let (engine, _) = test_engine(EngineOptions::new("fallible"));

    engine.enqueue(json!("doomed")).await.unwrap();

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut work = engine.work_stream().await.unwrap();
            while let Some(next) = work.recv().await {
                let Assignment { completer, .. } = next.unwrap();
                completer.fail("no thanks").await.unwrap();
            }
        })
    };

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 1).await;
    assert_eq!(records[0].status, Status::Error);
    assert_eq!(records[0].error.as_deref(), Some("no thanks"));

    engine.stop().await.unwrap();
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_panic_becomes_a_failed_completion() {
    let (engine, _) = test_engine(EngineOptions::new("panicky"));

    engine.enqueue(json!("explode")).await.unwrap();
    engine.enqueue(json!("fine")).await.unwrap();

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .serve(|payload| async move {
                    if payload == json!("explode") {
                        panic!("boom");
                    }
                    Ok(payload)
                })
                .await
        })
    };

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 2).await;

    let exploded = records
        .iter()
        .find(|r| r.payload == json!("explode"))
        .unwrap();
    assert_eq!(exploded.status, Status::Error);
    assert!(exploded.error.as_deref().unwrap().contains("panic"));

    let fine = records.iter().find(|r| r.payload == json!("fine")).unwrap();
    assert_eq!(fine.status, Status::Completed);

    // The loop survived the panic and still honors the stop protocol.
    engine.stop().await.unwrap();
    timeout(TEST_DEADLINE, worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------------------
// P5 — fan-out across worker subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn work_fans_out_across_two_workers() {
    let (engine, store) = test_engine(EngineOptions::new("fan-out"));

    let first = spawn_incrementing_worker(Arc::clone(&engine));
    let second = spawn_incrementing_worker(Arc::clone(&engine));

    for n in 0..20 {
        engine.enqueue(json!(n)).await.unwrap();
    }

    let mut completed = engine.completed_stream();
    let records = collect_completed(&mut completed, 20).await;
    assert_eq!(records.len(), 20);

    engine.stop().await.unwrap();
    let first = timeout(TEST_DEADLINE, first).await.unwrap().unwrap();
    let second = timeout(TEST_DEADLINE, second).await.unwrap().unwrap();
    assert_eq!(first + second, 20);

    // Both sentinels consumed: the shared worker count is back to zero.
    let count = store
        .counter(&relayq::keys::worker_count("fan-out"))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

// ---------------------------------------------------------------------------
// P6 — stop protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_terminates_every_idle_worker_exactly_once() {
    let (engine, store) = test_engine(EngineOptions::new("halting"));

    let workers: Vec<_> = (0..2)
        .map(|_| spawn_incrementing_worker(Arc::clone(&engine)))
        .collect();

    // Let both subscriptions register before the sentinel burst.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store
            .counter(&relayq::keys::worker_count("halting"))
            .await
            .unwrap(),
        2
    );

    engine.stop().await.unwrap();
    for worker in workers {
        let handled = timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
        assert_eq!(handled, 0);
    }
    assert_eq!(
        store
            .counter(&relayq::keys::worker_count("halting"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(engine.working_count().await.unwrap(), 0);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (engine, _) = test_engine(EngineOptions::new("stop-twice"));

    let worker = spawn_incrementing_worker(Arc::clone(&engine));
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.stop().await.unwrap();
    engine.stop().await.unwrap();

    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
    // Only the first stop() published sentinels: one worker, one sentinel,
    // nothing left behind on the pending queue.
    assert_eq!(engine.pending_len().await.unwrap(), 0);
}

#[tokio::test]
async fn work_stream_on_a_stopped_engine_completes_immediately() {
    let (engine, _) = test_engine(EngineOptions::new("already-stopped"));

    engine.stop().await.unwrap();

    let mut work = engine.work_stream().await.unwrap();
    assert!(timeout(TEST_DEADLINE, work.recv()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_heartbeats_aggregate_across_the_channel() {
    let (engine, _) = test_engine(
        EngineOptions::new("measured").stats_interval(Duration::from_millis(50)),
    );

    engine.enqueue(json!(1)).await.unwrap();
    engine.enqueue(json!(2)).await.unwrap();

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut work = engine.work_stream().await.unwrap();
            let mut first = true;
            while let Some(next) = work.recv().await {
                let Assignment { payload, completer } = next.unwrap();
                if first {
                    first = false;
                    completer.fail("bad batch").await.unwrap();
                } else {
                    completer.complete(payload).await.unwrap();
                }
            }
        })
    };

    let mut completed = engine.completed_stream();
    let _ = collect_completed(&mut completed, 2).await;

    let mut stats = engine
        .stats_stream(Duration::from_millis(100))
        .await
        .unwrap();
    let cluster = timeout(TEST_DEADLINE, async {
        loop {
            let cluster = stats.recv().await.expect("stats stream ended");
            if !cluster.workers.is_empty() {
                return cluster;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(cluster.workers.len(), 1);
    assert_eq!(cluster.summary.total_completed, 2);
    assert_eq!(cluster.summary.total_errors, 1);
    assert!((cluster.summary.total_error_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(cluster.summary.total_pending, 0);

    let snapshot = cluster.workers.values().next().unwrap();
    assert_eq!(snapshot.last_error.as_deref(), Some("bad batch"));
    assert!(snapshot.completed_bytes > 0);

    engine.stop().await.unwrap();
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}
