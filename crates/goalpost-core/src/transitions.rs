//! Timer- and counter-driven state transitions.
//!
//! Each pass is one short transaction built on the lock-by-select pattern
//! (`FOR NO KEY UPDATE SKIP LOCKED`): concurrent transition workers are
//! safe to run, each row makes progress under exactly one of them, and
//! none of these transactions ever suspends on user code.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use goalpost_db::models::GoalState;
use goalpost_db::queries::goals as db;

use crate::notify;
use crate::settings::EngineSettings;

/// Batch size for one retention pass.
const RETENTION_BATCH: i64 = 100;

/// Move date-due goals to `waiting_for_preconditions`.
/// Returns the number of goals moved.
pub async fn handle_waiting_for_date(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let changed = db::transition_date_due(&mut *tx, now).await?;
    tx.commit().await.context("failed to commit transaction")?;

    if changed > 0 {
        debug!(changed, "date-due goals moved to waiting_for_preconditions");
    }
    Ok(changed)
}

/// Move goals whose preconditions are satisfied to `waiting_for_worker`,
/// announcing each on the wakeup channel so sleeping dispatchers react
/// without polling. Returns the number of goals moved.
pub async fn handle_waiting_for_preconditions(pool: &PgPool) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let ids = db::take_preconditions_met(&mut *tx).await?;
    for id in &ids {
        notify::notify_goal_waiting_for_worker(&mut *tx, *id).await?;
    }
    tx.commit().await.context("failed to commit transaction")?;

    if !ids.is_empty() {
        debug!(count = ids.len(), "goals moved to waiting_for_worker");
    }
    Ok(ids.len() as u64)
}

/// Move goals with failed preconditions (and `block` behavior) to
/// `not_going_to_happen_soon`, propagating the failure to their own
/// dependents. Returns the number of goals moved.
pub async fn handle_waiting_for_failed_preconditions(pool: &PgPool) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let ids = db::take_preconditions_failed(&mut *tx).await?;
    if !ids.is_empty() {
        db::apply_failed_to_dependents(&mut *tx, &ids).await?;
    }
    tx.commit().await.context("failed to commit transaction")?;

    if !ids.is_empty() {
        debug!(count = ids.len(), "goals moved to not_going_to_happen_soon");
    }
    Ok(ids.len() as u64)
}

/// Move recovered goals (`not_going_to_happen_soon`, no failed
/// preconditions remaining) back to `waiting_for_date`, undoing the
/// failure accounting on their dependents. Returns the number moved.
pub async fn handle_unblocked_goals(pool: &PgPool) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let ids = db::take_unblock_eligible(&mut *tx).await?;
    if !ids.is_empty() {
        db::apply_unfailed_to_dependents(&mut *tx, &ids).await?;
    }
    tx.commit().await.context("failed to commit transaction")?;

    if !ids.is_empty() {
        debug!(count = ids.len(), "goals recovered to waiting_for_date");
    }
    Ok(ids.len() as u64)
}

/// Delete one batch of achieved goals older than the retention window.
///
/// An external table may still hold a RESTRICT reference to a goal; in
/// that case the whole batch is skipped with a warning so the worker loop
/// keeps going. Returns the number of goals deleted.
pub async fn remove_old_goals(
    pool: &PgPool,
    settings: &EngineSettings,
    now: DateTime<Utc>,
) -> Result<u64> {
    let Some(window) = settings.retention_window() else {
        return Ok(0);
    };
    let cutoff = now - window;

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let ids = db::lock_old_achieved(&mut *tx, cutoff, RETENTION_BATCH).await?;
    if ids.is_empty() {
        return Ok(0);
    }

    db::delete_goal_edges(&mut *tx, &ids).await?;
    match db::delete_goals(&mut *tx, &ids).await {
        Ok(deleted) => {
            tx.commit().await.context("failed to commit transaction")?;
            info!(deleted, "removed old achieved goals");
            Ok(deleted)
        }
        Err(err) if is_restrict_violation(&err) => {
            warn!(?err, "old goals are still referenced and protected; skipping batch");
            tx.rollback().await.context("failed to roll back transaction")?;
            Ok(0)
        }
        Err(err) => Err(err).context("failed to delete old goals"),
    }
}

/// True for a foreign-key violation raised by a RESTRICT reference.
fn is_restrict_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503")
    )
}

// -----------------------------------------------------------------------
// Failure bookkeeping shared by transitions, dispatch and the operator API
// -----------------------------------------------------------------------

/// Put goals into a failure-like state and charge the failure to their
/// dependents: `waiting_for_failed_count + 1` per edge, and for `proceed`
/// dependents `waiting_for_count - 1` (the failure satisfies them).
pub(crate) async fn mark_goals_failed(
    conn: &mut PgConnection,
    ids: &[Uuid],
    target: GoalState,
) -> Result<()> {
    debug_assert!(target.is_failure_like());
    db::update_goal_states(conn, ids, target).await?;
    db::apply_failed_to_dependents(conn, ids).await?;
    Ok(())
}

/// Put goals back to `waiting_for_date` and refund the failure on their
/// dependents (failed count only; `proceed` dependents keep the credit).
pub(crate) async fn mark_goals_unfailed(conn: &mut PgConnection, ids: &[Uuid]) -> Result<()> {
    db::update_goal_states(conn, ids, GoalState::WaitingForDate).await?;
    db::apply_unfailed_to_dependents(conn, ids).await?;
    Ok(())
}
