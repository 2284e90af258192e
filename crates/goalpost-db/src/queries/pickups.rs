//! Database query functions for the `goal_pickups` table.
//!
//! Pickups are written by the out-of-band pickup monitor, never inside the
//! dispatch transaction, so a worker crash mid-handler leaves its pickup
//! behind as evidence.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Record a pickup for a goal.
pub async fn insert_pickup(pool: &PgPool, goal: Uuid) -> Result<()> {
    sqlx::query("INSERT INTO goal_pickups (goal) VALUES ($1)")
        .bind(goal)
        .execute(pool)
        .await
        .context("failed to insert goal pickup")?;

    Ok(())
}

/// Release every pickup for a goal (called after the dispatch transaction
/// commits).
pub async fn delete_pickups(pool: &PgPool, goal: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM goal_pickups WHERE goal = $1")
        .bind(goal)
        .execute(pool)
        .await
        .context("failed to delete goal pickups")?;

    Ok(result.rows_affected())
}

/// Number of pickups currently recorded for a goal. A count at or above
/// the configured maximum marks the goal as a killer task.
pub async fn count_pickups(conn: &mut PgConnection, goal: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM goal_pickups WHERE goal = $1")
        .bind(goal)
        .fetch_one(conn)
        .await
        .context("failed to count goal pickups")?;

    Ok(row.0)
}
