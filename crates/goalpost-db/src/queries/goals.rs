//! Database query functions for the `goals` and `goal_dependencies` tables.
//!
//! Functions that must run inside a caller-owned transaction take
//! `&mut PgConnection`; pool-level reads take `&PgPool`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{Goal, GoalState};

/// Parameters for inserting a new goal row.
///
/// The id is chosen client-side so callers can subscribe to the goal's
/// progress channel before the row exists.
#[derive(Debug, Clone)]
pub struct NewGoal<'a> {
    pub id: Uuid,
    pub state: GoalState,
    pub handler: &'a str,
    pub instructions: Option<&'a serde_json::Value>,
    pub precondition_date: DateTime<Utc>,
    pub preconditions_mode: crate::models::PreconditionsMode,
    pub precondition_failure_behavior: crate::models::PreconditionFailureBehavior,
    pub waiting_for_count: i32,
    pub waiting_for_not_achieved_count: i32,
    pub waiting_for_failed_count: i32,
    pub deadline: DateTime<Utc>,
}

/// Insert a new goal row. Returns the inserted goal with server-generated
/// defaults (id, created_at).
pub async fn insert_goal(conn: &mut PgConnection, new: &NewGoal<'_>) -> Result<Goal> {
    let goal = sqlx::query_as::<_, Goal>(
        "INSERT INTO goals (id, state, handler, instructions, precondition_date, \
         preconditions_mode, precondition_failure_behavior, waiting_for_count, \
         waiting_for_not_achieved_count, waiting_for_failed_count, deadline) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.state)
    .bind(new.handler)
    .bind(new.instructions)
    .bind(new.precondition_date)
    .bind(new.preconditions_mode)
    .bind(new.precondition_failure_behavior)
    .bind(new.waiting_for_count)
    .bind(new.waiting_for_not_achieved_count)
    .bind(new.waiting_for_failed_count)
    .bind(new.deadline)
    .fetch_one(conn)
    .await
    .with_context(|| format!("failed to insert goal for handler {:?}", new.handler))?;

    Ok(goal)
}

/// Fetch a single goal by ID.
pub async fn get_goal(pool: &PgPool, id: Uuid) -> Result<Option<Goal>> {
    let goal = sqlx::query_as::<_, Goal>("SELECT * FROM goals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch goal")?;

    Ok(goal)
}

/// Fetch and row-lock a set of goals (`FOR NO KEY UPDATE`).
///
/// The non-key lock serializes against concurrent state flips without
/// blocking foreign-key readers. Blocks until every requested row is
/// available, which is the point: callers must observe settled states.
pub async fn lock_goals(conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Goal>> {
    let goals = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals WHERE id = ANY($1) ORDER BY id FOR NO KEY UPDATE",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .context("failed to lock goals")?;

    Ok(goals)
}

/// Update the state of a single goal. Returns rows affected (0 when the
/// goal does not exist).
pub async fn update_goal_state(conn: &mut PgConnection, id: Uuid, state: GoalState) -> Result<u64> {
    let result = sqlx::query("UPDATE goals SET state = $1 WHERE id = $2")
        .bind(state)
        .bind(id)
        .execute(conn)
        .await
        .context("failed to update goal state")?;

    Ok(result.rows_affected())
}

/// Update the state of several goals at once. Returns rows affected.
pub async fn update_goal_states(
    conn: &mut PgConnection,
    ids: &[Uuid],
    state: GoalState,
) -> Result<u64> {
    let result = sqlx::query("UPDATE goals SET state = $1 WHERE id = ANY($2)")
        .bind(state)
        .bind(ids)
        .execute(conn)
        .await
        .context("failed to update goal states")?;

    Ok(result.rows_affected())
}

/// Overwrite the three denormalized counters on a goal.
pub async fn update_goal_counters(
    conn: &mut PgConnection,
    id: Uuid,
    waiting_for_count: i32,
    waiting_for_not_achieved_count: i32,
    waiting_for_failed_count: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE goals \
         SET waiting_for_count = $1, \
             waiting_for_not_achieved_count = $2, \
             waiting_for_failed_count = $3 \
         WHERE id = $4",
    )
    .bind(waiting_for_count)
    .bind(waiting_for_not_achieved_count)
    .bind(waiting_for_failed_count)
    .bind(id)
    .execute(conn)
    .await
    .context("failed to update goal counters")?;

    Ok(result.rows_affected())
}

/// Reschedule a goal: state plus the precondition date (used by the
/// dispatch retry/yield paths).
pub async fn reschedule_goal(
    conn: &mut PgConnection,
    id: Uuid,
    state: GoalState,
    precondition_date: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE goals SET state = $1, precondition_date = $2 WHERE id = $3",
    )
    .bind(state)
    .bind(precondition_date)
    .bind(id)
    .execute(conn)
    .await
    .context("failed to reschedule goal")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Dependency edges
// -----------------------------------------------------------------------

/// Insert a dependency edge: `dependent_goal` waits on `precondition_goal`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent. Returns rows
/// affected (0 means the edge already existed; callers must not double
/// count it).
pub async fn insert_dependency(
    conn: &mut PgConnection,
    dependent_goal: Uuid,
    precondition_goal: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO goal_dependencies (dependent_goal, precondition_goal) \
         VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(dependent_goal)
    .bind(precondition_goal)
    .execute(conn)
    .await
    .context("failed to insert goal dependency")?;

    Ok(result.rows_affected())
}

/// IDs of the goals a given goal directly waits on.
pub async fn get_precondition_ids(conn: &mut PgConnection, goal_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT precondition_goal FROM goal_dependencies WHERE dependent_goal = $1")
            .bind(goal_id)
            .fetch_all(conn)
            .await
            .context("failed to get precondition ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Direct precondition IDs for a whole set of goals (deduplicated).
pub async fn get_precondition_ids_of(
    conn: &mut PgConnection,
    goal_ids: &[Uuid],
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT precondition_goal FROM goal_dependencies \
         WHERE dependent_goal = ANY($1)",
    )
    .bind(goal_ids)
    .fetch_all(conn)
    .await
    .context("failed to get precondition ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Fetch and lock the precondition goals of one dependent
/// (`FOR NO KEY UPDATE` on the goal rows only).
pub async fn lock_preconditions_of(conn: &mut PgConnection, goal_id: Uuid) -> Result<Vec<Goal>> {
    let goals = sqlx::query_as::<_, Goal>(
        "SELECT g.* FROM goals g \
         JOIN goal_dependencies d ON d.precondition_goal = g.id \
         WHERE d.dependent_goal = $1 \
         ORDER BY g.id \
         FOR NO KEY UPDATE OF g",
    )
    .bind(goal_id)
    .fetch_all(conn)
    .await
    .context("failed to lock precondition goals")?;

    Ok(goals)
}

// -----------------------------------------------------------------------
// Transition passes (lock-by-select, skip-locked)
// -----------------------------------------------------------------------

/// Flip every date-due goal to `waiting_for_preconditions`.
/// Returns rows changed.
pub async fn transition_date_due(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE goals \
         SET state = 'waiting_for_preconditions' \
         WHERE state = 'waiting_for_date' AND precondition_date <= $1",
    )
    .bind(now)
    .execute(conn)
    .await
    .context("failed to transition date-due goals")?;

    Ok(result.rows_affected())
}

/// Flip goals whose preconditions are met to `waiting_for_worker`.
///
/// The filter is `waiting_for_count <= 0`, not `= 0`: the counter may dip
/// below zero between an achievement decrement and the ANY-mode cap.
/// Returns the flipped ids so the caller can emit wakeup notifications.
pub async fn take_preconditions_met(conn: &mut PgConnection) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "WITH picked AS ( \
             SELECT id FROM goals \
             WHERE state = 'waiting_for_preconditions' AND waiting_for_count <= 0 \
             FOR NO KEY UPDATE SKIP LOCKED \
         ) \
         UPDATE goals \
         SET state = 'waiting_for_worker' \
         WHERE id IN (SELECT id FROM picked) \
         RETURNING id",
    )
    .fetch_all(conn)
    .await
    .context("failed to transition preconditions-met goals")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Flip goals with failed preconditions (and `block` behavior) to
/// `not_going_to_happen_soon`. Returns the flipped ids; the caller applies
/// the dependent bookkeeping.
pub async fn take_preconditions_failed(conn: &mut PgConnection) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "WITH picked AS ( \
             SELECT id FROM goals \
             WHERE state = 'waiting_for_preconditions' \
               AND precondition_failure_behavior = 'block' \
               AND waiting_for_failed_count > 0 \
             FOR NO KEY UPDATE SKIP LOCKED \
         ) \
         UPDATE goals \
         SET state = 'not_going_to_happen_soon' \
         WHERE id IN (SELECT id FROM picked) \
         RETURNING id",
    )
    .fetch_all(conn)
    .await
    .context("failed to transition failed-precondition goals")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Flip recovered goals (`not_going_to_happen_soon` with no failed
/// preconditions left) back to `waiting_for_date`. Returns the flipped ids.
pub async fn take_unblock_eligible(conn: &mut PgConnection) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "WITH picked AS ( \
             SELECT id FROM goals \
             WHERE state = 'not_going_to_happen_soon' AND waiting_for_failed_count <= 0 \
             FOR NO KEY UPDATE SKIP LOCKED \
         ) \
         UPDATE goals \
         SET state = 'waiting_for_date' \
         WHERE id IN (SELECT id FROM picked) \
         RETURNING id",
    )
    .fetch_all(conn)
    .await
    .context("failed to transition unblock-eligible goals")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Pick the single most urgent `waiting_for_worker` goal, row-locked and
/// skipping rows already claimed by other dispatchers.
///
/// `deadline_until` bounds the pick for horizon-limited dispatchers.
pub async fn pick_waiting_for_worker(
    conn: &mut PgConnection,
    deadline_until: Option<DateTime<Utc>>,
) -> Result<Option<Goal>> {
    let goal = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals \
         WHERE state = 'waiting_for_worker' \
           AND ($1::timestamptz IS NULL OR deadline <= $1) \
         ORDER BY deadline ASC \
         LIMIT 1 \
         FOR NO KEY UPDATE SKIP LOCKED",
    )
    .bind(deadline_until)
    .fetch_optional(conn)
    .await
    .context("failed to pick goal for dispatch")?;

    Ok(goal)
}

// -----------------------------------------------------------------------
// Dependent-counter bookkeeping
// -----------------------------------------------------------------------

/// Propagate achievement: for every dependent of `achieved_ids`, decrement
/// `waiting_for_count` and `waiting_for_not_achieved_count` once per edge.
pub async fn apply_achieved_to_dependents(
    conn: &mut PgConnection,
    achieved_ids: &[Uuid],
) -> Result<u64> {
    let result = sqlx::query(
        "WITH agg AS ( \
             SELECT dependent_goal, COUNT(*) AS n \
             FROM goal_dependencies \
             WHERE precondition_goal = ANY($1) \
             GROUP BY dependent_goal \
         ) \
         UPDATE goals g \
         SET waiting_for_count = g.waiting_for_count - agg.n, \
             waiting_for_not_achieved_count = \
                 GREATEST(g.waiting_for_not_achieved_count - agg.n, 0) \
         FROM agg \
         WHERE g.id = agg.dependent_goal",
    )
    .bind(achieved_ids)
    .execute(conn)
    .await
    .context("failed to propagate achievement to dependents")?;

    Ok(result.rows_affected())
}

/// Propagate failure: for every dependent of `failed_ids`, increment
/// `waiting_for_failed_count` once per edge; dependents with `proceed`
/// behavior also have `waiting_for_count` decremented, since the failed
/// precondition no longer blocks them.
pub async fn apply_failed_to_dependents(
    conn: &mut PgConnection,
    failed_ids: &[Uuid],
) -> Result<u64> {
    let result = sqlx::query(
        "WITH agg AS ( \
             SELECT dependent_goal, COUNT(*) AS n \
             FROM goal_dependencies \
             WHERE precondition_goal = ANY($1) \
             GROUP BY dependent_goal \
         ) \
         UPDATE goals g \
         SET waiting_for_failed_count = g.waiting_for_failed_count + agg.n, \
             waiting_for_count = CASE \
                 WHEN g.precondition_failure_behavior = 'proceed' \
                 THEN g.waiting_for_count - agg.n \
                 ELSE g.waiting_for_count \
             END \
         FROM agg \
         WHERE g.id = agg.dependent_goal",
    )
    .bind(failed_ids)
    .execute(conn)
    .await
    .context("failed to propagate failure to dependents")?;

    Ok(result.rows_affected())
}

/// Undo failure accounting: decrement dependents' `waiting_for_failed_count`
/// once per edge. `waiting_for_count` is left alone; `proceed` dependents
/// already counted the failure as satisfied.
pub async fn apply_unfailed_to_dependents(
    conn: &mut PgConnection,
    unfailed_ids: &[Uuid],
) -> Result<u64> {
    let result = sqlx::query(
        "WITH agg AS ( \
             SELECT dependent_goal, COUNT(*) AS n \
             FROM goal_dependencies \
             WHERE precondition_goal = ANY($1) \
             GROUP BY dependent_goal \
         ) \
         UPDATE goals g \
         SET waiting_for_failed_count = \
             GREATEST(g.waiting_for_failed_count - agg.n, 0) \
         FROM agg \
         WHERE g.id = agg.dependent_goal",
    )
    .bind(unfailed_ids)
    .execute(conn)
    .await
    .context("failed to undo failure accounting on dependents")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Deadline tightening
// -----------------------------------------------------------------------

/// Tighten the deadline on the given goals. Only goals whose deadline is
/// currently looser are touched, and achieved goals are skipped (the
/// propagation frontier stops there). Returns the ids actually updated.
pub async fn tighten_deadlines(
    conn: &mut PgConnection,
    ids: &[Uuid],
    deadline: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE goals \
         SET deadline = $2 \
         WHERE id = ANY($1) AND deadline > $2 AND state <> 'achieved' \
         RETURNING id",
    )
    .bind(ids)
    .bind(deadline)
    .fetch_all(conn)
    .await
    .context("failed to tighten deadlines")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// -----------------------------------------------------------------------
// Retention
// -----------------------------------------------------------------------

/// Select and lock a batch of achieved goals older than `cutoff`.
pub async fn lock_old_achieved(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM goals \
         WHERE state = 'achieved' AND created_at < $1 \
         ORDER BY created_at \
         LIMIT $2 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(conn)
    .await
    .context("failed to select old achieved goals")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete every dependency edge touching the given goals, in either
/// direction.
pub async fn delete_goal_edges(conn: &mut PgConnection, ids: &[Uuid]) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM goal_dependencies \
         WHERE dependent_goal = ANY($1) OR precondition_goal = ANY($1)",
    )
    .bind(ids)
    .execute(conn)
    .await
    .context("failed to delete goal dependency edges")?;

    Ok(result.rows_affected())
}

/// Delete the given goals. Fails when an external table still holds a
/// RESTRICT reference; the caller decides whether that is fatal.
pub async fn delete_goals(conn: &mut PgConnection, ids: &[Uuid]) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM goals WHERE id = ANY($1)")
        .bind(ids)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Fsck support
// -----------------------------------------------------------------------

/// Fetch and lock the first unlocked goal with `id >= after`, in id order.
/// Returns `None` once the id space is exhausted.
pub async fn next_goal_from(conn: &mut PgConnection, after: Uuid) -> Result<Option<Goal>> {
    let goal = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals \
         WHERE id >= $1 \
         ORDER BY id \
         LIMIT 1 \
         FOR NO KEY UPDATE SKIP LOCKED",
    )
    .bind(after)
    .fetch_optional(conn)
    .await
    .context("failed to fetch next goal by id")?;

    Ok(goal)
}

/// Count goals per state across the whole table.
pub async fn count_goals_by_state(pool: &PgPool) -> Result<Vec<(GoalState, i64)>> {
    let rows: Vec<(GoalState, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM goals GROUP BY state ORDER BY state",
    )
    .fetch_all(pool)
    .await
    .context("failed to count goals by state")?;

    Ok(rows)
}

/// Fetch and lock the first unlocked `given_up` goal with `id >= after`,
/// in id order. Used by the operator retry walk.
pub async fn next_given_up_from(conn: &mut PgConnection, after: Uuid) -> Result<Option<Goal>> {
    let goal = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals \
         WHERE id >= $1 AND state = 'given_up' \
         ORDER BY id \
         LIMIT 1 \
         FOR NO KEY UPDATE SKIP LOCKED",
    )
    .bind(after)
    .fetch_optional(conn)
    .await
    .context("failed to fetch next given-up goal")?;

    Ok(goal)
}
