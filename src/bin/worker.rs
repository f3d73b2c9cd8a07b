//! chronod worker - attempt execution process.
//!
//! Pops envelopes from the ready queue and runs the attempt pipeline.
//! Graceful shutdown on SIGINT/SIGTERM: stop popping, drain in-flight
//! attempts up to the grace window, then exit.

use std::sync::Arc;

use chronod::clock::SystemClock;
use chronod::config::Config;
use chronod::executor::{CustomExecutor, ExecutorRegistry, LogMailer};
use chronod::notifier::LogNotifier;
use chronod::planner::Planner;
use chronod::queue::{MemoryQueue, QueueBackend, RedisQueue};
use chronod::shutdown::wait_for_termination;
use chronod::store::{JobStore, MemoryStore, PgStore};
use chronod::telemetry;
use chronod::worker::{log_retention_loop, WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("warning: could not load config: {}. using defaults.", e);
        Config::default()
    });

    telemetry::init("chronod-worker", &config.log)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chronod worker");

    let store: Arc<dyn JobStore> = if config.database.is_memory() {
        tracing::warn!("using in-memory store; state will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::connect(&config.database).await?;
        tracing::info!("connected to store");
        Arc::new(store)
    };

    let queue: Arc<dyn QueueBackend> = if config.queue.is_memory() {
        tracing::warn!("using in-memory queue; envelopes will not survive a restart");
        Arc::new(MemoryQueue::new(std::time::Duration::from_secs(
            config.queue.stall_timeout_secs,
        )))
    } else {
        Arc::new(RedisQueue::connect(&config.queue)?)
    };

    let clock = Arc::new(SystemClock);
    let planner = Arc::new(Planner::new(store.clone(), queue.clone(), clock.clone()));

    // Deployment-specific custom handlers register here before the registry
    // is shared.
    let custom = CustomExecutor::new();
    let executors = Arc::new(ExecutorRegistry::builtin(Arc::new(LogMailer), custom));

    let pool = Arc::new(WorkerPool::new(
        WorkerConfig::from_settings(&config.worker),
        store.clone(),
        queue,
        planner,
        executors,
        Arc::new(LogNotifier),
        clock.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let retention = tokio::spawn(log_retention_loop(
        store,
        clock,
        shutdown_rx.clone(),
    ));
    let runner = tokio::spawn(pool.run(shutdown_rx));

    wait_for_termination().await;
    let _ = shutdown_tx.send(true);

    let _ = runner.await;
    retention.abort();

    tracing::info!("worker shutdown complete");
    Ok(())
}
