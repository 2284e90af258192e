//! Worker subcommands: busy, blocking, and threaded runtimes.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use goalpost_core::worker::{BusyWorkerOptions, ThreadSpec};
use goalpost_core::{
    Dispatcher, EngineSettings, Handler, HandlerContext, HandlerOutcome, HandlerRegistry,
    PickupMonitor, worker,
};

/// Built-in do-nothing handler, useful for wiring checks and smoke tests.
struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::AllDone)
    }
}

/// The registry served by the stock binary.
///
/// Deployments with real handlers embed `goalpost-core` in their own
/// binary and register them here-equivalent at startup; the stock binary
/// only knows `noop`.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("noop", NoopHandler);
    registry
}

fn build_dispatcher(pool: &PgPool, settings: &EngineSettings) -> (Dispatcher, tokio::task::JoinHandle<()>) {
    let (pickups, pickup_join) = PickupMonitor::spawn(pool.clone());
    let dispatcher = Dispatcher::new(
        pool.clone(),
        builtin_registry(),
        settings.clone(),
        pickups,
    );
    (dispatcher, pickup_join)
}

pub async fn run_busy_worker(
    pool: &PgPool,
    settings: &EngineSettings,
    stop: &CancellationToken,
    max_progress_count: Option<u64>,
    once: bool,
) -> Result<()> {
    let (dispatcher, pickup_join) = build_dispatcher(pool, settings);
    let options = BusyWorkerOptions {
        once,
        max_progress_count,
    };
    let result = worker::busy_worker(&dispatcher, stop, &options).await;
    drop(dispatcher);
    let _ = pickup_join.await;
    result
}

pub async fn run_blocking_worker(
    pool: &PgPool,
    settings: &EngineSettings,
    stop: &CancellationToken,
) -> Result<()> {
    let (dispatcher, pickup_join) = build_dispatcher(pool, settings);
    let result = worker::blocking_worker(&dispatcher, stop).await;
    drop(dispatcher);
    let _ = pickup_join.await;
    result
}

pub async fn run_threaded_worker(
    pool: &PgPool,
    settings: &EngineSettings,
    stop: &CancellationToken,
    specs: &[ThreadSpec],
    once: bool,
) -> Result<()> {
    let specs = if specs.is_empty() {
        info!("no --threads given, defaulting to one dispatcher");
        vec![ThreadSpec {
            count: 1,
            deadline_horizon: None,
        }]
    } else {
        specs.to_vec()
    };

    let (dispatcher, pickup_join) = build_dispatcher(pool, settings);
    let result = worker::threaded_worker(&dispatcher, &specs, once, stop).await;
    drop(dispatcher);
    let _ = pickup_join.await;
    result
}
