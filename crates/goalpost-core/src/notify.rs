//! The notification bus: one shared `goal_waiting_for_worker` channel that
//! wakes sleeping dispatchers, and one `goal_progress_<hex-id>` channel per
//! goal that carries state changes to waiters.
//!
//! Notifications are emitted with `pg_notify(...)` so they can be issued
//! inside the transaction that causes them; PostgreSQL delivers them only
//! on commit.

use anyhow::{Context, Result};
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Channel that announces goals entering `waiting_for_worker`.
/// Payload: the goal id.
pub const GOAL_WAITING_FOR_WORKER_CHANNEL: &str = "goal_waiting_for_worker";

/// Per-goal progress channel name. Payload: the new state name.
pub fn goal_progress_channel(goal_id: Uuid) -> String {
    format!("goal_progress_{}", goal_id.simple())
}

/// Announce that a goal is waiting for a worker to pick it up.
pub async fn notify_goal_waiting_for_worker(conn: &mut PgConnection, goal_id: Uuid) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(GOAL_WAITING_FOR_WORKER_CHANNEL)
        .bind(goal_id.to_string())
        .execute(conn)
        .await
        .context("failed to notify goal_waiting_for_worker")?;
    Ok(())
}

/// Announce a goal's new state on its progress channel.
pub async fn notify_goal_progress(pool: &PgPool, goal_id: Uuid, state: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(goal_progress_channel(goal_id))
        .bind(state)
        .execute(pool)
        .await
        .context("failed to notify goal progress")?;
    Ok(())
}

/// Subscribe to the shared worker-wakeup channel.
pub async fn listen_goal_waiting_for_worker(pool: &PgPool) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .context("failed to open notification listener")?;
    listener
        .listen(GOAL_WAITING_FOR_WORKER_CHANNEL)
        .await
        .context("failed to listen on goal_waiting_for_worker")?;
    Ok(listener)
}

/// Subscribe to one goal's progress channel.
pub async fn listen_goal_progress(pool: &PgPool, goal_id: Uuid) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .context("failed to open notification listener")?;
    listener
        .listen(&goal_progress_channel(goal_id))
        .await
        .context("failed to listen on goal progress channel")?;
    Ok(listener)
}

/// Block for the next notification on a subscribed listener, then
/// unsubscribe from every channel so later messages do not accumulate on
/// the connection.
pub async fn wait(listener: &mut PgListener) -> Result<PgNotification> {
    let notification = listener
        .recv()
        .await
        .context("failed to receive notification")?;
    listener
        .unlisten_all()
        .await
        .context("failed to unsubscribe listener")?;
    Ok(notification)
}
