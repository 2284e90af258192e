//! Shared setup for engine integration tests: a temp database plus a
//! dispatcher wired with the stock test handlers.

// Not every test binary uses every helper.
#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use goalpost_core::{
    Dispatcher, EngineSettings, Handler, HandlerContext, HandlerOutcome, HandlerRegistry,
    PickupMonitor, RetryMeLater,
};
use goalpost_db::models::Goal;
use goalpost_db::queries::goals as db;
use goalpost_test_utils::TestDb;

/// Succeeds immediately.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::AllDone)
    }
}

/// Always fails.
pub struct FailHandler;

#[async_trait]
impl Handler for FailHandler {
    async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
        Err(anyhow!("I failed!"))
    }
}

/// Yields forever, echoing back the message from its kwargs.
pub struct YieldHandler;

#[async_trait]
impl Handler for YieldHandler {
    async fn pursue(&self, ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
        let message = ctx
            .kwargs()
            .and_then(|k| k.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("yielding")
            .to_owned();
        Ok(HandlerOutcome::RetryMeLater(
            RetryMeLater::new().message(message),
        ))
    }
}

/// Violates a unique constraint inside the handler savepoint.
pub struct DbErrorHandler;

#[async_trait]
impl Handler for DbErrorHandler {
    async fn pursue(&self, ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
        let id = ctx.goal().id;
        sqlx::query("INSERT INTO goals (id, handler) VALUES ($1, 'dup')")
            .bind(id)
            .execute(ctx.conn())
            .await?;
        Ok(HandlerOutcome::AllDone)
    }
}

pub struct TestEngine {
    pub pool: PgPool,
    pub dispatcher: Dispatcher,
    pub settings: EngineSettings,
    db: TestDb,
    pickup_join: JoinHandle<()>,
}

/// Settings tuned for tests: no retention surprises, quick give-up knobs
/// left at their defaults.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        retention_seconds: Some(7 * 24 * 3600),
        ..EngineSettings::default()
    }
}

/// The stock registry: `noop`, `fail`, `yield`, `db-error`.
pub fn stock_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("noop", NoopHandler);
    registry.register("fail", FailHandler);
    registry.register("yield", YieldHandler);
    registry.register("db-error", DbErrorHandler);
    registry
}

/// Temp database + dispatcher with the stock registry and given settings.
pub async fn setup_with(registry: HandlerRegistry, settings: EngineSettings) -> TestEngine {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let (pickups, pickup_join) = PickupMonitor::spawn(pool.clone());
    let dispatcher = Dispatcher::new(pool.clone(), registry, settings.clone(), pickups);
    TestEngine {
        pool,
        dispatcher,
        settings,
        db,
        pickup_join,
    }
}

pub async fn setup() -> TestEngine {
    setup_with(stock_registry(), test_settings()).await
}

impl TestEngine {
    /// Re-read a goal, which must still exist.
    pub async fn goal(&self, id: uuid::Uuid) -> Goal {
        db::get_goal(&self.pool, id)
            .await
            .expect("goal fetch should succeed")
            .expect("goal should exist")
    }

    pub async fn teardown(self) {
        let TestEngine {
            dispatcher,
            pickup_join,
            db,
            ..
        } = self;
        drop(dispatcher);
        let _ = pickup_join.await;
        db.teardown().await;
    }
}
