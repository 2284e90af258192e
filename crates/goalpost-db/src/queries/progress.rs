//! Database query functions for the `goal_progress` table.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::GoalProgress;

/// Append a progress row for one handler invocation. Progress rows are
/// immutable once written.
pub async fn insert_progress(
    conn: &mut PgConnection,
    goal: Uuid,
    success: bool,
    time_taken_ms: Option<i64>,
    message: &str,
) -> Result<GoalProgress> {
    let progress = sqlx::query_as::<_, GoalProgress>(
        "INSERT INTO goal_progress (goal, success, time_taken_ms, message) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(goal)
    .bind(success)
    .bind(time_taken_ms)
    .bind(message)
    .fetch_one(conn)
    .await
    .context("failed to insert goal progress")?;

    Ok(progress)
}

/// Number of failed attempts recorded for a goal. Drives the retry
/// backoff exponent and the give-up threshold.
pub async fn count_failures(conn: &mut PgConnection, goal: Uuid) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM goal_progress WHERE goal = $1 AND success = false")
            .bind(goal)
            .fetch_one(conn)
            .await
            .context("failed to count goal failures")?;

    Ok(row.0)
}

/// Total number of progress rows for a goal (successes and failures).
pub async fn count_progress(conn: &mut PgConnection, goal: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM goal_progress WHERE goal = $1")
        .bind(goal)
        .fetch_one(conn)
        .await
        .context("failed to count goal progress")?;

    Ok(row.0)
}

/// List all progress rows for a goal, oldest first.
pub async fn list_progress(pool: &PgPool, goal: Uuid) -> Result<Vec<GoalProgress>> {
    let progress = sqlx::query_as::<_, GoalProgress>(
        "SELECT * FROM goal_progress WHERE goal = $1 ORDER BY created_at ASC",
    )
    .bind(goal)
    .fetch_all(pool)
    .await
    .context("failed to list goal progress")?;

    Ok(progress)
}
