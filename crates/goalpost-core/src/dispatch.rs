//! Worker dispatch: pick one eligible goal, run its handler, record the
//! outcome.
//!
//! One dispatch step is a single transaction. The handler itself runs in a
//! savepoint inside that transaction, so a database error raised by user
//! code rolls back the handler's writes without poisoning the engine's
//! ability to record a failed progress row and reschedule the goal.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Acquire, PgConnection, PgPool};
use tracing::{info, warn};

use goalpost_db::models::{Goal, GoalProgress, GoalState, PreconditionsMode};
use goalpost_db::queries::goals as db;
use goalpost_db::queries::pickups as pickups_db;
use goalpost_db::queries::progress as progress_db;

use crate::handler::{
    HandlerContext, HandlerOutcome, HandlerRegistry, RetryMeLater, RetryMeLaterError,
};
use crate::limits;
use crate::notify;
use crate::pickups::PickupMonitor;
use crate::scheduler::count_preconditions;
use crate::settings::EngineSettings;
use crate::transitions::mark_goals_failed;

/// Base delay of the exponential retry backoff.
const RETRY_BASE_SECONDS: i64 = 10;

/// Progress messages are short; anything longer is truncated.
const MAX_MESSAGE_LEN: usize = 500;

/// A worker's handle on the engine: everything one dispatch step needs.
#[derive(Clone)]
pub struct Dispatcher {
    pool: PgPool,
    registry: HandlerRegistry,
    settings: EngineSettings,
    pickups: PickupMonitor,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        registry: HandlerRegistry,
        settings: EngineSettings,
        pickups: PickupMonitor,
    ) -> Self {
        Self {
            pool,
            registry,
            settings,
            pickups,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one dispatch step: pick the most urgent `waiting_for_worker`
    /// goal (optionally only within `deadline_horizon`), invoke its
    /// handler, record progress. Returns `None` when there is no work.
    pub async fn handle_waiting_for_worker(
        &self,
        deadline_horizon: Option<Duration>,
    ) -> Result<Option<GoalProgress>> {
        let now = Utc::now();
        let deadline_until = deadline_horizon.map(|h| now + h);

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin dispatch transaction")?;

        let Some(goal) = db::pick_waiting_for_worker(&mut *tx, deadline_until).await? else {
            return Ok(None);
        };

        warn_on_counter_drift(&goal);

        // A goal whose pickups keep accumulating is crashing its workers;
        // terminate it instead of running the handler again.
        let prior_pickups = pickups_db::count_pickups(&mut *tx, goal.id).await?;
        if prior_pickups >= self.settings.max_pickups {
            warn!(goal_id = %goal.id, prior_pickups, "goal looks like a killer task; giving up");
            mark_goals_failed(&mut *tx, &[goal.id], GoalState::GivenUp).await?;
            let progress = progress_db::insert_progress(
                &mut *tx,
                goal.id,
                false,
                None,
                &format!("killer task: {prior_pickups} unreleased pickups"),
            )
            .await?;
            tx.commit().await.context("failed to commit dispatch transaction")?;
            self.pickups.release(goal.id);
            notify::notify_goal_progress(&self.pool, goal.id, &GoalState::GivenUp.to_string())
                .await?;
            return Ok(Some(progress));
        }

        // Out-of-band, so a crash during the handler leaves the pickup
        // visible for the check above.
        self.pickups.pickup(goal.id);

        info!(goal_id = %goal.id, handler = %goal.handler, "pursuing goal");
        let started = std::time::Instant::now();
        let outcome = self.pursue_in_savepoint(&mut tx, &goal).await?;
        let time_taken_ms = started.elapsed().as_millis() as i64;

        let (success, message, final_state) = match outcome {
            Ok(HandlerOutcome::RetryMeLater(retry)) => {
                let state = self.apply_retry_me_later(&mut *tx, &goal, &retry, now).await?;
                (true, retry.message, state)
            }
            Ok(HandlerOutcome::AllDone) => {
                db::update_goal_state(&mut *tx, goal.id, GoalState::Achieved).await?;
                db::apply_achieved_to_dependents(&mut *tx, &[goal.id]).await?;
                (true, String::new(), GoalState::Achieved)
            }
            Err(err) => {
                warn!(goal_id = %goal.id, err = format!("{err:#}"), "goal handler failed");
                let state = self.apply_failure(&mut *tx, &goal, now).await?;
                (false, format!("{err:#}"), state)
            }
        };

        let progress = progress_db::insert_progress(
            &mut *tx,
            goal.id,
            success,
            Some(time_taken_ms),
            truncated(&message),
        )
        .await?;

        // One attempt past the per-goal cap gives up, even on a
        // success-equivalent outcome, unless the goal just achieved.
        let final_state = self
            .apply_progress_cap(&mut *tx, &goal, final_state)
            .await?;

        tx.commit()
            .await
            .context("failed to commit dispatch transaction")?;

        self.pickups.release(goal.id);
        notify::notify_goal_progress(&self.pool, goal.id, &final_state.to_string()).await?;

        info!(goal_id = %goal.id, state = %final_state, success, "goal progress recorded");
        Ok(Some(progress))
    }

    /// Run the handler inside a savepoint under the configured resource
    /// limits. The outer `Result` is an engine failure (cannot even manage
    /// the savepoint); the inner one is the handler's own outcome.
    async fn pursue_in_savepoint(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        goal: &Goal,
    ) -> Result<Result<HandlerOutcome>> {
        let mut savepoint = tx
            .begin()
            .await
            .context("failed to open handler savepoint")?;

        let outcome = match self.registry.resolve(&goal.handler) {
            Ok(handler) => {
                let mut ctx = HandlerContext::new(goal, &mut *savepoint, &self.settings);
                limits::run_with_limits(&self.settings, handler.pursue(&mut ctx)).await
            }
            Err(err) => Err(err),
        };

        let outcome = match outcome {
            Ok(outcome) => match savepoint.commit().await {
                Ok(()) => Ok(outcome),
                Err(err) => Err(anyhow::Error::new(err).context("handler savepoint failed to commit")),
            },
            Err(err) => {
                // Rolls back whatever the handler wrote, including after a
                // database error that aborted the savepoint.
                let _ = savepoint.rollback().await;
                Err(err)
            }
        };

        // The exceptional yield form is equivalent to returning it.
        Ok(match outcome {
            Err(err) => match err.downcast::<RetryMeLaterError>() {
                Ok(retry) => Ok(HandlerOutcome::RetryMeLater(retry.0)),
                Err(err) => Err(err),
            },
            ok => ok,
        })
    }

    /// Failure path: exponential backoff, or give up once the next attempt
    /// would cross the threshold.
    async fn apply_failure(
        &self,
        conn: &mut PgConnection,
        goal: &Goal,
        now: DateTime<Utc>,
    ) -> Result<GoalState> {
        let prior_failures = progress_db::count_failures(conn, goal.id).await?;

        if prior_failures + 1 >= self.settings.give_up_at {
            mark_goals_failed(conn, &[goal.id], GoalState::GivenUp).await?;
            return Ok(GoalState::GivenUp);
        }

        let delay = Duration::seconds(RETRY_BASE_SECONDS << prior_failures.min(32));
        db::reschedule_goal(conn, goal.id, GoalState::WaitingForDate, now + delay).await?;
        Ok(GoalState::WaitingForDate)
    }

    /// Yield path: back to `waiting_for_date`, not before the supplied
    /// date, with any new precondition edges wired in.
    async fn apply_retry_me_later(
        &self,
        conn: &mut PgConnection,
        goal: &Goal,
        retry: &RetryMeLater,
        now: DateTime<Utc>,
    ) -> Result<GoalState> {
        let supplied = retry.precondition_date.unwrap_or(now);
        let date = goal.precondition_date.max(supplied);
        db::reschedule_goal(conn, goal.id, GoalState::WaitingForDate, date).await?;

        self.add_preconditions_on_yield(conn, goal, &retry.precondition_goals)
            .await?;
        Ok(GoalState::WaitingForDate)
    }

    /// Wire new precondition edges onto a yielding goal and refresh its
    /// counters, under the same locking rules as `schedule`.
    async fn add_preconditions_on_yield(
        &self,
        conn: &mut PgConnection,
        goal: &Goal,
        observed: &[Goal],
    ) -> Result<()> {
        let mut not_achieved = goal.waiting_for_not_achieved_count;
        let mut failed = goal.waiting_for_failed_count;
        let mut waiting_for = goal.waiting_for_count;
        let mut forced_eligible = false;

        if !observed.is_empty() {
            let ids: Vec<_> = observed.iter().map(|g| g.id).collect();
            let locked = db::lock_goals(conn, &ids).await?;

            // Only count edges that did not already exist.
            let mut fresh = Vec::new();
            for pre in &locked {
                if db::insert_dependency(conn, goal.id, pre.id).await? > 0 {
                    fresh.push(pre.clone());
                }
            }

            let delta = count_preconditions(
                observed,
                &fresh,
                goal.preconditions_mode,
                goal.precondition_failure_behavior,
            );
            not_achieved += delta.not_achieved;
            failed += delta.failed;
            waiting_for += delta.waiting_for;
            forced_eligible = delta.forced_eligible;
        }

        // An ANY-mode goal that yields starts a fresh wait round: it must
        // wait for exactly one thing when anything is still unachieved,
        // and nothing when everything settled (or a precondition settled
        // between the handler's observation and our lock).
        if goal.preconditions_mode == PreconditionsMode::Any {
            let mut unsatisfied = not_achieved;
            if goal.precondition_failure_behavior
                == goalpost_db::models::PreconditionFailureBehavior::Proceed
            {
                unsatisfied -= failed;
            }
            waiting_for = if forced_eligible {
                0
            } else {
                unsatisfied.clamp(0, 1)
            };
        }

        db::update_goal_counters(conn, goal.id, waiting_for, not_achieved, failed).await?;
        Ok(())
    }

    /// Enforce the per-goal attempt cap: once progress rows reach the cap
    /// and the goal did not just achieve, it is given up.
    async fn apply_progress_cap(
        &self,
        conn: &mut PgConnection,
        goal: &Goal,
        final_state: GoalState,
    ) -> Result<GoalState> {
        let Some(cap) = self.settings.max_progress_count else {
            return Ok(final_state);
        };
        if final_state == GoalState::Achieved || final_state == GoalState::GivenUp {
            return Ok(final_state);
        }

        let total = progress_db::count_progress(conn, goal.id).await?;
        if total >= cap {
            warn!(goal_id = %goal.id, total, cap, "goal exceeded max progress count; giving up");
            mark_goals_failed(conn, &[goal.id], GoalState::GivenUp).await?;
            return Ok(GoalState::GivenUp);
        }
        Ok(final_state)
    }
}

/// Log (but tolerate) counters that disagree with the worker-eligibility
/// invariants. Fsck is the remediation.
fn warn_on_counter_drift(goal: &Goal) {
    let consistent = match goal.preconditions_mode {
        PreconditionsMode::All => goal.waiting_for_count == 0,
        PreconditionsMode::Any => goal.waiting_for_count <= 0,
    };
    if !consistent {
        warn!(
            goal_id = %goal.id,
            waiting_for_count = goal.waiting_for_count,
            mode = %goal.preconditions_mode,
            "picked goal with inconsistent waiting_for_count; run fsck"
        );
    }
    if goal.waiting_for_not_achieved_count < 0 || goal.waiting_for_failed_count < 0 {
        warn!(
            goal_id = %goal.id,
            "picked goal with negative precondition counters; run fsck"
        );
    }
}

fn truncated(message: &str) -> &str {
    match message.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}
