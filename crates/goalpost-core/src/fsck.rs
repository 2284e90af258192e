//! Counter reconciliation: recompute the denormalized `waiting_for_*`
//! counters from the dependency edges and their targets' actual states.
//!
//! This is the ground truth for counter drift. The walk visits every goal
//! in id order, one short transaction per goal, under
//! `FOR NO KEY UPDATE SKIP LOCKED` so it never deadlocks with live
//! workers; a second run over a quiet database makes zero writes.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use goalpost_db::models::{Goal, GoalState, PreconditionFailureBehavior, PreconditionsMode};
use goalpost_db::queries::goals as db;

use crate::scheduler::next_uuid;

/// Result of one full reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Goals visited.
    pub checked: u64,
    /// Goals whose counters were corrected.
    pub fixed: u64,
}

/// Walk every goal and fix its counters. Returns a summary report.
pub async fn check_fix_all(pool: &PgPool) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let mut cursor = Uuid::nil();

    loop {
        let Some((goal_id, fixed)) = check_fix_goal(pool, cursor).await? else {
            break;
        };

        report.checked += 1;
        if fixed {
            report.fixed += 1;
        }
        if report.checked % 1000 == 0 {
            info!(checked = report.checked, "fsck progress");
        }

        let Some(next) = next_uuid(goal_id) else {
            break;
        };
        cursor = next;
    }

    info!(checked = report.checked, fixed = report.fixed, "fsck complete");
    Ok(report)
}

/// Check and fix the first unlocked goal with `id >= cursor`.
///
/// Returns the visited goal's id and whether anything was written, or
/// `None` when the id space is exhausted.
async fn check_fix_goal(pool: &PgPool, cursor: Uuid) -> Result<Option<(Uuid, bool)>> {
    let mut tx = pool.begin().await.context("failed to begin fsck transaction")?;

    let Some(goal) = db::next_goal_from(&mut *tx, cursor).await? else {
        return Ok(None);
    };

    let preconditions = db::lock_preconditions_of(&mut *tx, goal.id).await?;
    let (waiting_for, not_achieved, failed) = recount(&goal, &preconditions);

    let fixed = waiting_for != goal.waiting_for_count
        || not_achieved != goal.waiting_for_not_achieved_count
        || failed != goal.waiting_for_failed_count;

    if fixed {
        warn!(
            goal_id = %goal.id,
            db_waiting_for = goal.waiting_for_count,
            recalculated_waiting_for = waiting_for,
            db_not_achieved = goal.waiting_for_not_achieved_count,
            recalculated_not_achieved = not_achieved,
            db_failed = goal.waiting_for_failed_count,
            recalculated_failed = failed,
            "fixing drifted goal counters"
        );
        db::update_goal_counters(&mut *tx, goal.id, waiting_for, not_achieved, failed).await?;
    }

    tx.commit().await.context("failed to commit fsck transaction")?;
    Ok(Some((goal.id, fixed)))
}

/// Recompute the three counters from edge truth.
fn recount(goal: &Goal, preconditions: &[Goal]) -> (i32, i32, i32) {
    let mut not_achieved = 0;
    let mut failed = 0;
    for pre in preconditions {
        if pre.state != GoalState::Achieved {
            not_achieved += 1;
        }
        if pre.state.is_failure_like() {
            failed += 1;
        }
    }

    let mut waiting_for = not_achieved;
    if goal.precondition_failure_behavior == PreconditionFailureBehavior::Proceed {
        waiting_for -= failed;
    }
    if goal.preconditions_mode == PreconditionsMode::Any {
        waiting_for = waiting_for.min(1);
    }

    (waiting_for, not_achieved, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use goalpost_db::models::GoalState;

    fn goal_with(mode: PreconditionsMode, behavior: PreconditionFailureBehavior) -> Goal {
        let now = Utc::now();
        Goal {
            id: Uuid::new_v4(),
            state: GoalState::WaitingForPreconditions,
            handler: "noop".to_owned(),
            instructions: None,
            precondition_date: now,
            preconditions_mode: mode,
            precondition_failure_behavior: behavior,
            waiting_for_count: 0,
            waiting_for_not_achieved_count: 0,
            waiting_for_failed_count: 0,
            deadline: now,
            created_at: now,
        }
    }

    fn pre(state: GoalState) -> Goal {
        let mut g = goal_with(PreconditionsMode::All, PreconditionFailureBehavior::Block);
        g.state = state;
        g
    }

    #[test]
    fn recount_all_block() {
        let goal = goal_with(PreconditionsMode::All, PreconditionFailureBehavior::Block);
        let pres = vec![
            pre(GoalState::Achieved),
            pre(GoalState::WaitingForDate),
            pre(GoalState::GivenUp),
        ];
        assert_eq!(recount(&goal, &pres), (2, 2, 1));
    }

    #[test]
    fn recount_proceed_subtracts_failures() {
        let goal = goal_with(PreconditionsMode::All, PreconditionFailureBehavior::Proceed);
        let pres = vec![pre(GoalState::WaitingForDate), pre(GoalState::Blocked)];
        assert_eq!(recount(&goal, &pres), (1, 2, 1));
    }

    #[test]
    fn recount_any_caps_at_one() {
        let goal = goal_with(PreconditionsMode::Any, PreconditionFailureBehavior::Block);
        let pres = vec![
            pre(GoalState::WaitingForDate),
            pre(GoalState::WaitingForDate),
            pre(GoalState::WaitingForDate),
        ];
        assert_eq!(recount(&goal, &pres), (1, 3, 0));
    }

    #[test]
    fn recount_no_preconditions_is_zero() {
        let goal = goal_with(PreconditionsMode::All, PreconditionFailureBehavior::Block);
        assert_eq!(recount(&goal, &[]), (0, 0, 0));
    }
}
