//! Tests for the fork_many stream adapter.

use relayq::engine::{Assignment, Engine, EngineOptions};
use relayq::fork::fork_many;
use relayq::model::Status;
use relayq::store::MemoryStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_DEADLINE: Duration = Duration::from_secs(10);

fn test_engine(queue: &str) -> Arc<Engine> {
    Arc::new(Engine::new(
        Arc::new(MemoryStore::new()),
        EngineOptions::new(queue),
    ))
}

#[tokio::test]
async fn upstream_values_come_back_as_completed_records() {
    let engine = test_engine("forked");

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut work = engine.work_stream().await.unwrap();
            while let Some(next) = work.recv().await {
                let Assignment { payload, completer } = next.unwrap();
                let n = payload.as_i64().unwrap();
                completer.complete(json!(n + 1)).await.unwrap();
            }
        })
    };

    let (tx, rx) = mpsc::channel(8);
    let mut forked = fork_many(rx, Arc::clone(&engine));

    for n in [1, 2, 3] {
        tx.send(json!(n)).await.unwrap();
    }

    let mut results = Vec::new();
    for _ in 0..3 {
        let record = timeout(TEST_DEADLINE, forked.recv())
            .await
            .expect("timed out waiting on forked stream")
            .expect("forked stream ended early")
            .expect("forked stream errored");
        assert_eq!(record.status, Status::Completed);
        results.push(record.completed_payload.unwrap().as_i64().unwrap());
    }
    results.sort_unstable();
    assert_eq!(results, vec![2, 3, 4]);

    engine.stop().await.unwrap();
    timeout(TEST_DEADLINE, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn dropping_the_fork_disposes_the_upstream_driver() {
    let engine = test_engine("disposed");

    let (tx, rx) = mpsc::channel(1);
    let forked = fork_many(rx, Arc::clone(&engine));

    tx.send(json!(1)).await.unwrap();
    drop(forked);

    // The aborted driver drops its receiver; the upstream sender
    // eventually observes a closed channel.
    timeout(TEST_DEADLINE, tx.closed()).await.unwrap();
    assert!(tx.send(json!(2)).await.is_err());
}
