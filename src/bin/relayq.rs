//! relayq CLI — operator interface to a relayq deployment.

use clap::{Parser, Subcommand};
use relayq::config::Config;
use relayq::engine::{Engine, EngineOptions};
use relayq::store::PgStore;
use relayq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "relayq", about = "Distributed work queue over a shared store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an echo worker daemon on a queue (completes work with its own
    /// payload; useful for smoke-testing a deployment)
    Serve {
        /// Logical queue name
        queue: String,
        /// Max concurrently dispatched items (0 = unbounded)
        #[arg(long, default_value_t = 4)]
        throttle: usize,
        /// Per-item deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Enqueue payloads and print their completions as they arrive
    Produce {
        /// Logical queue name
        queue: String,
        /// How many items to enqueue
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// JSON payload for every item (default: {"seq": n})
        #[arg(long)]
        payload: Option<String>,
        /// Send stop sentinels to the queue's workers once all
        /// completions are in
        #[arg(long)]
        stop: bool,
    },
    /// Print aggregated cluster stats for a queue
    Stats {
        /// Logical queue name
        queue: String,
        /// Aggregation period in milliseconds
        #[arg(long, default_value_t = 3000)]
        period_ms: u64,
    },
    /// Empty a queue's pending list and working set
    Clear {
        /// Logical queue name
        queue: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let store = PgStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    let store = Arc::new(store);

    match cli.command {
        Command::Serve {
            queue,
            throttle,
            timeout_ms,
        } => cmd_serve(store, &config, queue, throttle, timeout_ms).await,
        Command::Produce {
            queue,
            count,
            payload,
            stop,
        } => cmd_produce(store, queue, count, payload, stop).await,
        Command::Stats { queue, period_ms } => cmd_stats(store, queue, period_ms).await,
        Command::Clear { queue } => {
            let engine = Engine::new(store, EngineOptions::new(&queue));
            engine.clear().await?;
            println!("cleared {queue}");
            Ok(())
        }
    }
}

async fn cmd_serve(
    store: Arc<PgStore>,
    config: &Config,
    queue: String,
    throttle: usize,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "relayq".to_string(),
    })?;

    let mut options = EngineOptions::new(&queue).work_throttle(throttle);
    if let Some(ms) = timeout_ms {
        options = options.work_timeout(Duration::from_millis(ms));
    }
    let engine = Arc::new(Engine::new(store, options));

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.serve(|payload| async move { Ok(payload) }).await })
    };

    tokio::select! {
        result = worker => result??,
        _ = tokio::signal::ctrl_c() => {
            println!("\nshutting down");
        }
    }
    Ok(())
}

async fn cmd_produce(
    store: Arc<PgStore>,
    queue: String,
    count: usize,
    payload: Option<String>,
    stop: bool,
) -> anyhow::Result<()> {
    let payload: Option<serde_json::Value> = payload.as_deref().map(serde_json::from_str).transpose()?;

    let engine = Engine::new(store, EngineOptions::new(&queue).completed_throttle(16));
    let mut completed = engine.completed_stream();

    for seq in 0..count {
        let value = payload
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "seq": seq }));
        let id = engine.enqueue(value).await?;
        println!("enqueued {id}");
    }

    let mut received = 0;
    while received < count {
        let Some(item) = completed.recv().await else {
            anyhow::bail!("completed stream ended after {received}/{count} items");
        };
        let item = item?;
        received += 1;
        match &item.error {
            Some(error) => println!("error     {} — {error}", item.id),
            None => println!(
                "completed {} — {}",
                item.id,
                item.completed_payload
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            ),
        }
    }

    if stop {
        engine.stop().await?;
        // Drain anything that raced in behind the expected completions.
        while let Some(item) = completed.recv().await {
            let item = item?;
            println!("drained   {}", item.id);
        }
        println!("stopped {queue}");
    }

    Ok(())
}

async fn cmd_stats(store: Arc<PgStore>, queue: String, period_ms: u64) -> anyhow::Result<()> {
    let engine = Engine::new(store, EngineOptions::new(&queue));
    let mut stats = engine.stats_stream(Duration::from_millis(period_ms)).await?;

    println!("watching {queue} (ctrl-c to quit)");
    loop {
        tokio::select! {
            snapshot = stats.recv() => {
                let Some(stats) = snapshot else { break };
                let s = &stats.summary;
                println!(
                    "workers={} pending={} completed={} errors={} error_rate={:.3} avg_ms={:.1}",
                    stats.workers.len(),
                    s.total_pending,
                    s.total_completed,
                    s.total_errors,
                    s.total_error_rate,
                    s.avg_work_time_ms,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
