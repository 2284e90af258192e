//! The scheduler API: creating goals, operator block/unblock, and the
//! given-up retry walk.
//!
//! `schedule` is callable both from application code (own transaction) and
//! from inside a handler's savepoint, where child goals inherit the
//! running goal's deadline.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use goalpost_db::models::{
    Goal, GoalState, PreconditionFailureBehavior, PreconditionsMode,
};
use goalpost_db::queries::goals as db;

use crate::error::EngineError;
use crate::notify;
use crate::settings::EngineSettings;
use crate::transitions::{mark_goals_failed, mark_goals_unfailed};

/// Parameters for creating a goal.
#[derive(Debug)]
pub struct ScheduleSpec<'a> {
    /// Handler name, resolved against the registry at dispatch time.
    pub handler: &'a str,
    /// Positional arguments stored in the goal's instructions.
    pub args: Vec<serde_json::Value>,
    /// Keyword arguments stored in the goal's instructions.
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Earliest pickup instant. When absent, the goal skips straight past
    /// the date gate.
    pub precondition_date: Option<DateTime<Utc>>,
    /// Goals to wait on, as currently observed by the caller. States are
    /// re-read under lock; the observed states feed the ANY-mode
    /// just-flipped rule.
    pub precondition_goals: Vec<Goal>,
    /// Create the goal pre-blocked (operator will unblock later).
    pub blocked: bool,
    /// Explicit deadline. Defaults to the scheduling handler's deadline,
    /// or now + the configured default delta.
    pub deadline: Option<DateTime<Utc>>,
    pub preconditions_mode: PreconditionsMode,
    pub precondition_failure_behavior: PreconditionFailureBehavior,
    /// Preassigned id, used to subscribe to the progress channel before
    /// the goal exists. A fresh v4 id is generated when absent.
    pub id: Option<Uuid>,
}

impl<'a> ScheduleSpec<'a> {
    pub fn new(handler: &'a str) -> Self {
        Self {
            handler,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            precondition_date: None,
            precondition_goals: Vec::new(),
            blocked: false,
            deadline: None,
            preconditions_mode: PreconditionsMode::All,
            precondition_failure_behavior: PreconditionFailureBehavior::Block,
            id: None,
        }
    }
}

/// Create a goal in its own transaction.
pub async fn schedule(
    pool: &PgPool,
    settings: &EngineSettings,
    spec: ScheduleSpec<'_>,
) -> Result<Goal> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let goal = schedule_on(&mut *tx, settings, spec, None).await?;
    tx.commit().await.context("failed to commit transaction")?;
    Ok(goal)
}

/// Create a goal and subscribe to its progress channel first, so that no
/// progress notification can be missed by the caller.
pub async fn schedule_listening(
    pool: &PgPool,
    settings: &EngineSettings,
    mut spec: ScheduleSpec<'_>,
) -> Result<(Goal, PgListener)> {
    let id = spec.id.unwrap_or_else(Uuid::new_v4);
    spec.id = Some(id);
    let listener = notify::listen_goal_progress(pool, id).await?;
    let goal = schedule(pool, settings, spec).await?;
    Ok((goal, listener))
}

/// Create a goal on an existing connection (transaction or handler
/// savepoint). `inherited_deadline` is the running handler's goal deadline
/// when called from dispatch.
pub(crate) async fn schedule_on(
    conn: &mut PgConnection,
    settings: &EngineSettings,
    spec: ScheduleSpec<'_>,
    inherited_deadline: Option<DateTime<Utc>>,
) -> Result<Goal> {
    let now = Utc::now();
    let id = spec.id.unwrap_or_else(Uuid::new_v4);
    let deadline = spec
        .deadline
        .or(inherited_deadline)
        .unwrap_or(now + settings.default_deadline());

    // Lock the precondition rows before reading their states and creating
    // edges. This serializes against a dispatch transaction about to flip
    // one of them to achieved: without the lock, that flip could miss the
    // not-yet-created edge and strand the new goal forever.
    let mut precondition_ids: Vec<Uuid> = spec.precondition_goals.iter().map(|g| g.id).collect();
    precondition_ids.sort_unstable();
    precondition_ids.dedup();
    let locked = if precondition_ids.is_empty() {
        Vec::new()
    } else {
        db::lock_goals(conn, &precondition_ids).await?
    };
    if locked.len() != precondition_ids.len() {
        anyhow::bail!(
            "{} precondition goal(s) no longer exist",
            precondition_ids.len() - locked.len()
        );
    }

    let counters = count_preconditions(
        &spec.precondition_goals,
        &locked,
        spec.preconditions_mode,
        spec.precondition_failure_behavior,
    );

    let state = if spec.blocked {
        GoalState::Blocked
    } else if spec.precondition_date.is_some() {
        GoalState::WaitingForDate
    } else if !spec.precondition_goals.is_empty() {
        GoalState::WaitingForPreconditions
    } else {
        GoalState::WaitingForWorker
    };

    let instructions = serde_json::json!({
        "args": spec.args,
        "kwargs": spec.kwargs,
    });

    let goal = db::insert_goal(
        conn,
        &db::NewGoal {
            id,
            state,
            handler: spec.handler,
            instructions: Some(&instructions),
            precondition_date: spec.precondition_date.unwrap_or(now),
            preconditions_mode: spec.preconditions_mode,
            precondition_failure_behavior: spec.precondition_failure_behavior,
            waiting_for_count: counters.waiting_for,
            waiting_for_not_achieved_count: counters.not_achieved,
            waiting_for_failed_count: counters.failed,
            deadline,
        },
    )
    .await?;

    for pre in &locked {
        db::insert_dependency(conn, goal.id, pre.id).await?;
    }

    if state == GoalState::WaitingForWorker {
        notify::notify_goal_waiting_for_worker(conn, goal.id).await?;
    }

    // Every ancestor chain must be at least as urgent as its dependent.
    if !precondition_ids.is_empty() {
        tighten_ancestor_deadlines(conn, &precondition_ids, deadline).await?;
    }

    info!(goal_id = %goal.id, handler = spec.handler, %state, "scheduled goal");
    Ok(goal)
}

/// Counter values derived from precondition states.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PreconditionCounters {
    pub waiting_for: i32,
    pub not_achieved: i32,
    pub failed: i32,
    /// ANY mode only: a precondition settled between the caller's
    /// observation and our lock, so the goal must not wait any further.
    pub forced_eligible: bool,
}

/// Derive the three counters for a goal acquiring the given preconditions.
///
/// `observed` is the caller's (possibly stale) view of the precondition
/// rows; `locked` is the same rows read under lock. In ANY mode, a
/// precondition that flipped to achieved (or, under `proceed`, to a
/// failure-like state) between observation and lock forces
/// `waiting_for = 0`: the caller was about to depend on it and it just
/// settled, so the goal must become eligible rather than wait for
/// something else that may never happen.
pub(crate) fn count_preconditions(
    observed: &[Goal],
    locked: &[Goal],
    mode: PreconditionsMode,
    failure_behavior: PreconditionFailureBehavior,
) -> PreconditionCounters {
    let mut not_achieved = 0;
    let mut failed = 0;
    let mut achieved_flip = false;
    let mut failed_flip = false;

    for current in locked {
        let observed_state = observed
            .iter()
            .find(|g| g.id == current.id)
            .map(|g| g.state);

        if current.state != GoalState::Achieved {
            not_achieved += 1;
        } else if observed_state.is_some_and(|s| s != GoalState::Achieved) {
            achieved_flip = true;
        }

        if current.state.is_failure_like() {
            failed += 1;
            if observed_state.is_some_and(|s| !s.is_failure_like()) {
                failed_flip = true;
            }
        }
    }

    let mut waiting_for = not_achieved;
    if failure_behavior == PreconditionFailureBehavior::Proceed {
        waiting_for -= failed;
    }
    let mut forced_eligible = false;
    if mode == PreconditionsMode::Any {
        waiting_for = waiting_for.min(1);
        forced_eligible = achieved_flip
            || (failure_behavior == PreconditionFailureBehavior::Proceed && failed_flip);
        if forced_eligible {
            waiting_for = 0;
        }
    }

    PreconditionCounters {
        waiting_for,
        not_achieved,
        failed,
        forced_eligible,
    }
}

/// Tighten deadlines up the precondition-ancestor subgraph.
///
/// Worklist traversal with a visited set (a goal can be reached through
/// multiple paths). Only goals whose deadline currently exceeds the new
/// one are updated and expanded, so the walk terminates; achieved goals
/// stop the propagation.
pub(crate) async fn tighten_ancestor_deadlines(
    conn: &mut PgConnection,
    start: &[Uuid],
    deadline: DateTime<Utc>,
) -> Result<()> {
    let mut visited: HashSet<Uuid> = start.iter().copied().collect();
    let mut frontier: Vec<Uuid> = start.to_vec();

    while !frontier.is_empty() {
        let updated = db::tighten_deadlines(conn, &frontier, deadline).await?;
        if updated.is_empty() {
            break;
        }
        let parents = db::get_precondition_ids_of(conn, &updated).await?;
        frontier = parents
            .into_iter()
            .filter(|id| visited.insert(*id))
            .collect();
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Operator actions
// -----------------------------------------------------------------------

/// Block a waiting goal. Fails with [`EngineError::InvalidStateForAction`]
/// for goals that are already terminal or failed.
pub async fn block(pool: &PgPool, goal_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let goal = lock_one(&mut *tx, goal_id).await?;

    if !goal.state.is_waiting() {
        return Err(EngineError::InvalidStateForAction {
            goal_id,
            state: goal.state,
            action: "block",
        }
        .into());
    }

    mark_goals_failed(&mut *tx, &[goal_id], GoalState::Blocked).await?;
    tx.commit().await.context("failed to commit transaction")?;

    info!(%goal_id, "goal blocked");
    Ok(())
}

/// Unblock or retry a failed goal: back to `waiting_for_date`, refunding
/// the failure on dependents. Works for any failure-like state.
pub async fn unblock_retry(pool: &PgPool, goal_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let goal = lock_one(&mut *tx, goal_id).await?;

    if !goal.state.is_failure_like() {
        return Err(EngineError::InvalidStateForAction {
            goal_id,
            state: goal.state,
            action: "unblock/retry",
        }
        .into());
    }

    mark_goals_unfailed(&mut *tx, &[goal_id]).await?;
    tx.commit().await.context("failed to commit transaction")?;

    info!(%goal_id, "goal unblocked for retry");
    Ok(())
}

/// Walk every `given_up` goal in id order and unblock-retry each,
/// one short transaction per goal, skipping rows other operators hold.
/// Returns the number of goals retried.
pub async fn retry_all_given_up(pool: &PgPool, limit: Option<u64>) -> Result<u64> {
    let mut cursor = Uuid::nil();
    let mut count = 0u64;

    loop {
        if limit.is_some_and(|l| count >= l) {
            info!(limit = ?limit, "reached retry limit");
            break;
        }

        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        let Some(goal) = db::next_given_up_from(&mut *tx, cursor).await? else {
            break;
        };
        mark_goals_unfailed(&mut *tx, &[goal.id]).await?;
        tx.commit().await.context("failed to commit transaction")?;

        info!(goal_id = %goal.id, "retried given-up goal");
        count += 1;

        let Some(next) = next_uuid(goal.id) else {
            break;
        };
        cursor = next;
    }

    Ok(count)
}

async fn lock_one(conn: &mut PgConnection, goal_id: Uuid) -> Result<Goal> {
    let goals = db::lock_goals(conn, &[goal_id]).await?;
    goals
        .into_iter()
        .next()
        .with_context(|| format!("goal {goal_id} not found"))
}

/// The next id in uuid order, or `None` at the top of the id space.
pub(crate) fn next_uuid(id: Uuid) -> Option<Uuid> {
    id.as_u128().checked_add(1).map(Uuid::from_u128)
}

// -----------------------------------------------------------------------
// State summaries for external consumers
// -----------------------------------------------------------------------

/// True when the goal is achieved, or gone entirely (achieved long ago
/// and removed by retention).
pub fn is_goal_completed(goal: Option<&Goal>) -> bool {
    match goal {
        None => true,
        Some(g) => g.state == GoalState::Achieved,
    }
}

/// True while the goal is still expected to make progress. A blocked goal
/// counts as processing: the assumption is it will be unblocked.
pub fn is_goal_processing(goal: Option<&Goal>) -> bool {
    goal.is_some_and(|g| g.state.is_waiting() || g.state == GoalState::Blocked)
}

/// True when the goal has failed or is stuck behind a failure.
pub fn is_goal_error(goal: Option<&Goal>) -> bool {
    goal.is_some_and(|g| {
        matches!(
            g.state,
            GoalState::GivenUp | GoalState::NotGoingToHappenSoon
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn goal_in_state(state: GoalState) -> Goal {
        let now = Utc::now();
        Goal {
            id: Uuid::new_v4(),
            state,
            handler: "noop".to_owned(),
            instructions: None,
            precondition_date: now,
            preconditions_mode: PreconditionsMode::All,
            precondition_failure_behavior: PreconditionFailureBehavior::Block,
            waiting_for_count: 0,
            waiting_for_not_achieved_count: 0,
            waiting_for_failed_count: 0,
            deadline: now,
            created_at: now,
        }
    }

    fn relocked(goal: &Goal, state: GoalState) -> Goal {
        let mut g = goal.clone();
        g.state = state;
        g
    }

    #[test]
    fn counters_all_mode_counts_every_unachieved() {
        let a = goal_in_state(GoalState::WaitingForWorker);
        let b = goal_in_state(GoalState::Achieved);
        let observed = vec![a.clone(), b.clone()];
        let locked = vec![a, b];

        let c = count_preconditions(
            &observed,
            &locked,
            PreconditionsMode::All,
            PreconditionFailureBehavior::Block,
        );
        assert_eq!(
            c,
            PreconditionCounters {
                waiting_for: 1,
                not_achieved: 1,
                failed: 0,
                forced_eligible: false
            }
        );
    }

    #[test]
    fn counters_proceed_subtracts_failed() {
        let a = goal_in_state(GoalState::GivenUp);
        let b = goal_in_state(GoalState::WaitingForDate);
        let observed = vec![a.clone(), b.clone()];
        let locked = vec![a, b];

        let c = count_preconditions(
            &observed,
            &locked,
            PreconditionsMode::All,
            PreconditionFailureBehavior::Proceed,
        );
        assert_eq!(
            c,
            PreconditionCounters {
                waiting_for: 1,
                not_achieved: 2,
                failed: 1,
                forced_eligible: false
            }
        );
    }

    #[test]
    fn counters_any_mode_caps_at_one() {
        let a = goal_in_state(GoalState::WaitingForDate);
        let b = goal_in_state(GoalState::WaitingForDate);
        let observed = vec![a.clone(), b.clone()];
        let locked = vec![a, b];

        let c = count_preconditions(
            &observed,
            &locked,
            PreconditionsMode::Any,
            PreconditionFailureBehavior::Block,
        );
        assert_eq!(c.waiting_for, 1);
        assert_eq!(c.not_achieved, 2);
    }

    #[test]
    fn counters_any_mode_forces_zero_on_achieved_flip() {
        // Caller observed both goals waiting; one achieved before we
        // could lock it. The new goal must become eligible.
        let a = goal_in_state(GoalState::WaitingForWorker);
        let b = goal_in_state(GoalState::WaitingForDate);
        let observed = vec![a.clone(), b.clone()];
        let locked = vec![relocked(&a, GoalState::Achieved), b];

        let c = count_preconditions(
            &observed,
            &locked,
            PreconditionsMode::Any,
            PreconditionFailureBehavior::Block,
        );
        assert_eq!(c.waiting_for, 0);
        assert_eq!(c.not_achieved, 1);
        assert!(c.forced_eligible);
    }

    #[test]
    fn counters_any_proceed_forces_zero_on_failure_flip() {
        let a = goal_in_state(GoalState::WaitingForWorker);
        let b = goal_in_state(GoalState::WaitingForDate);
        let observed = vec![a.clone(), b.clone()];
        let locked = vec![relocked(&a, GoalState::GivenUp), b];

        let c = count_preconditions(
            &observed,
            &locked,
            PreconditionsMode::Any,
            PreconditionFailureBehavior::Proceed,
        );
        assert_eq!(c.waiting_for, 0);
        assert_eq!(c.failed, 1);
    }

    #[test]
    fn next_uuid_increments_and_stops_at_max() {
        let id = Uuid::from_u128(41);
        assert_eq!(next_uuid(id), Some(Uuid::from_u128(42)));
        assert_eq!(next_uuid(Uuid::from_u128(u128::MAX)), None);
    }

    #[test]
    fn status_helpers() {
        assert!(is_goal_completed(None));
        assert!(is_goal_completed(Some(&goal_in_state(GoalState::Achieved))));
        assert!(!is_goal_completed(Some(&goal_in_state(GoalState::GivenUp))));

        assert!(is_goal_processing(Some(&goal_in_state(GoalState::Blocked))));
        assert!(is_goal_processing(Some(&goal_in_state(
            GoalState::WaitingForWorker
        ))));
        assert!(!is_goal_processing(None));

        assert!(is_goal_error(Some(&goal_in_state(GoalState::GivenUp))));
        assert!(is_goal_error(Some(&goal_in_state(
            GoalState::NotGoingToHappenSoon
        ))));
        assert!(!is_goal_error(Some(&goal_in_state(GoalState::Blocked))));
    }
}
