//! chronod server - scheduler process entry point.
//!
//! Owns the planner and its store/queue connections. The REST layer that
//! exposes the planner is mounted by the deployment around this process.

use std::sync::Arc;

use chronod::clock::SystemClock;
use chronod::config::Config;
use chronod::planner::Planner;
use chronod::queue::{MemoryQueue, QueueBackend, RedisQueue};
use chronod::shutdown::wait_for_termination;
use chronod::store::{JobStore, MemoryStore, PgStore};
use chronod::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("warning: could not load config: {}. using defaults.", e);
        Config::default()
    });

    telemetry::init("chronod-server", &config.log)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chronod server");

    let store: Arc<dyn JobStore> = if config.database.is_memory() {
        tracing::warn!("using in-memory store; state will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::connect(&config.database).await?;
        store.migrate().await?;
        tracing::info!("connected to store, migrations applied");
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

    let planner = Arc::new(Planner::new(store, queue, Arc::new(SystemClock)));
    tracing::info!(
        port = config.server.port,
        api_prefix = %config.server.api_prefix,
        "planner ready"
    );

    // The planner serves requests until the process is told to stop.
    let _planner = planner;
    wait_for_termination().await;

    tracing::info!("server shutdown complete");
    Ok(())
}
