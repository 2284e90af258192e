//! End-to-end dispatch tests: handler outcomes, retry backoff, yields with
//! preconditions, the savepoint, resource limits, killer tasks, and the
//! progress notifications.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use goalpost_core::{
    Handler, HandlerContext, HandlerOutcome, RetryMeLater, RetryMeLaterError, ScheduleSpec,
    notify, schedule, schedule_listening, transitions,
};
use goalpost_db::models::{GoalState, PreconditionFailureBehavior, PreconditionsMode};
use goalpost_db::queries::goals as db;
use goalpost_db::queries::progress;

use common::{TestEngine, setup, setup_with, stock_registry, test_settings};

/// Put a goal straight back on the worker queue.
async fn force_waiting_for_worker(engine: &TestEngine, id: uuid::Uuid) {
    let mut conn = engine.pool.acquire().await.unwrap();
    db::reschedule_goal(&mut *conn, id, GoalState::WaitingForWorker, Utc::now())
        .await
        .unwrap();
}

#[tokio::test]
async fn simple_achievement_emits_one_progress_and_notification() {
    let engine = setup().await;

    let (goal, mut listener) =
        schedule_listening(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
            .await
            .unwrap();
    assert_eq!(goal.state, GoalState::WaitingForWorker);
    assert_eq!(goal.waiting_for_count, 0);

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("should dispatch the goal");
    assert!(progress.success);
    assert!(progress.time_taken_ms.is_some());

    assert_eq!(engine.goal(goal.id).await.state, GoalState::Achieved);

    let mut conn = engine.pool.acquire().await.unwrap();
    assert_eq!(progress::count_progress(&mut *conn, goal.id).await.unwrap(), 1);
    drop(conn);

    let notification = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        notify::wait(&mut listener).await
    })
    .await
    .expect("progress notification should arrive")
    .unwrap();
    assert_eq!(
        notification.channel(),
        format!("goal_progress_{}", goal.id.simple())
    );
    assert_eq!(notification.payload(), "achieved");

    engine.teardown().await;
}

#[tokio::test]
async fn dispatch_returns_none_when_no_work() {
    let engine = setup().await;

    let result = engine.dispatcher.handle_waiting_for_worker(None).await.unwrap();
    assert!(result.is_none());

    engine.teardown().await;
}

#[tokio::test]
async fn linear_dependency_runs_in_order() {
    let engine = setup().await;

    let a = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
        .await
        .unwrap();
    let mut spec = ScheduleSpec::new("noop");
    spec.precondition_goals = vec![a.clone()];
    let b = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    assert_eq!(a.state, GoalState::WaitingForWorker);
    assert_eq!(b.state, GoalState::WaitingForPreconditions);
    assert_eq!(b.waiting_for_count, 1);

    engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("a should be dispatched");
    assert_eq!(engine.goal(a.id).await.state, GoalState::Achieved);
    assert_eq!(engine.goal(b.id).await.waiting_for_count, 0);

    transitions::handle_waiting_for_preconditions(&engine.pool)
        .await
        .unwrap();
    assert_eq!(engine.goal(b.id).await.state, GoalState::WaitingForWorker);

    engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("b should be dispatched");
    assert_eq!(engine.goal(b.id).await.state, GoalState::Achieved);

    engine.teardown().await;
}

#[tokio::test]
async fn failure_with_block_behavior_strands_dependents_without_running_them() {
    let mut settings = test_settings();
    settings.give_up_at = 1;
    let engine = setup_with(stock_registry(), settings).await;

    let a = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("fail"))
        .await
        .unwrap();
    let mut spec = ScheduleSpec::new("noop");
    spec.precondition_goals = vec![a.clone()];
    let b = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("a should be dispatched");
    assert!(!progress.success);
    assert!(progress.message.contains("I failed!"));

    assert_eq!(engine.goal(a.id).await.state, GoalState::GivenUp);
    assert_eq!(engine.goal(b.id).await.waiting_for_failed_count, 1);

    transitions::handle_waiting_for_failed_preconditions(&engine.pool)
        .await
        .unwrap();
    assert_eq!(engine.goal(b.id).await.state, GoalState::NotGoingToHappenSoon);

    let mut conn = engine.pool.acquire().await.unwrap();
    assert_eq!(progress::count_progress(&mut *conn, b.id).await.unwrap(), 0);

    engine.teardown().await;
}

#[tokio::test]
async fn failure_with_proceed_behavior_lets_dependents_run() {
    let mut settings = test_settings();
    settings.give_up_at = 1;
    let engine = setup_with(stock_registry(), settings).await;

    let a = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("fail"))
        .await
        .unwrap();
    let mut spec = ScheduleSpec::new("noop");
    spec.precondition_failure_behavior = PreconditionFailureBehavior::Proceed;
    spec.precondition_goals = vec![a.clone()];
    let b = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("a should be dispatched");

    let b_row = engine.goal(b.id).await;
    assert_eq!(b_row.waiting_for_count, 0);
    assert_eq!(b_row.waiting_for_failed_count, 1);

    transitions::handle_waiting_for_preconditions(&engine.pool)
        .await
        .unwrap();
    assert_eq!(engine.goal(b.id).await.state, GoalState::WaitingForWorker);

    engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("b should be dispatched");
    assert_eq!(engine.goal(b.id).await.state, GoalState::Achieved);

    let mut conn = engine.pool.acquire().await.unwrap();
    assert_eq!(progress::count_progress(&mut *conn, b.id).await.unwrap(), 1);

    engine.teardown().await;
}

#[tokio::test]
async fn failure_backs_off_exponentially_then_gives_up() {
    let engine = setup().await; // give_up_at = 3

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("fail"))
        .await
        .unwrap();

    // Attempt 1: 0 prior failures, retry in 10s.
    let before = Utc::now();
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();
    let row = engine.goal(goal.id).await;
    assert_eq!(row.state, GoalState::WaitingForDate);
    let delay = row.precondition_date - before;
    assert!(delay >= Duration::seconds(9) && delay <= Duration::seconds(12), "delay was {delay}");

    // Attempt 2: 1 prior failure, retry in 20s.
    force_waiting_for_worker(&engine, goal.id).await;
    let before = Utc::now();
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();
    let row = engine.goal(goal.id).await;
    assert_eq!(row.state, GoalState::WaitingForDate);
    let delay = row.precondition_date - before;
    assert!(delay >= Duration::seconds(19) && delay <= Duration::seconds(22), "delay was {delay}");

    // Attempt 3: 2 prior failures, 2 + 1 reaches give_up_at.
    force_waiting_for_worker(&engine, goal.id).await;
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();
    assert_eq!(engine.goal(goal.id).await.state, GoalState::GivenUp);

    let mut conn = engine.pool.acquire().await.unwrap();
    assert_eq!(progress::count_failures(&mut *conn, goal.id).await.unwrap(), 3);

    engine.teardown().await;
}

#[tokio::test]
async fn yield_reschedules_with_supplied_date_and_message() {
    struct YieldUntilTomorrow;

    #[async_trait]
    impl Handler for YieldUntilTomorrow {
        async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::RetryMeLater(
                RetryMeLater::new()
                    .after(Utc::now() + Duration::days(1))
                    .message("waiting for tomorrow"),
            ))
        }
    }

    let mut registry = stock_registry();
    registry.register("yield-tomorrow", YieldUntilTomorrow);
    let engine = setup_with(registry, test_settings()).await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("yield-tomorrow"))
        .await
        .unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(progress.success, "a yield is a successful attempt");
    assert_eq!(progress.message, "waiting for tomorrow");

    let row = engine.goal(goal.id).await;
    assert_eq!(row.state, GoalState::WaitingForDate);
    assert!(row.precondition_date > Utc::now() + Duration::hours(23));

    engine.teardown().await;
}

#[tokio::test]
async fn yield_by_exception_is_a_success() {
    struct RaisesRetry;

    #[async_trait]
    impl Handler for RaisesRetry {
        async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
            Err(RetryMeLaterError(RetryMeLater::new().message("asdf")).into())
        }
    }

    let mut registry = stock_registry();
    registry.register("raises-retry", RaisesRetry);
    let engine = setup_with(registry, test_settings()).await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("raises-retry"))
        .await
        .unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(progress.success);
    assert_eq!(progress.message, "asdf");
    assert_eq!(engine.goal(goal.id).await.state, GoalState::WaitingForDate);

    engine.teardown().await;
}

#[tokio::test]
async fn handler_can_schedule_children_that_inherit_the_deadline() {
    struct SpawnAndWait;

    #[async_trait]
    impl Handler for SpawnAndWait {
        async fn pursue(&self, ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
            let child = ctx.schedule(ScheduleSpec::new("noop")).await?;
            Ok(HandlerOutcome::RetryMeLater(
                RetryMeLater::new()
                    .behind(vec![child])
                    .message("waiting for child"),
            ))
        }
    }

    let mut registry = stock_registry();
    registry.register("spawn-and-wait", SpawnAndWait);
    let engine = setup_with(registry, test_settings()).await;

    let mut spec = ScheduleSpec::new("spawn-and-wait");
    spec.deadline = Some(Utc::now() + Duration::days(1));
    let parent = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();

    let parent_row = engine.goal(parent.id).await;
    assert_eq!(parent_row.state, GoalState::WaitingForDate);
    assert_eq!(parent_row.waiting_for_count, 1);
    assert_eq!(parent_row.waiting_for_not_achieved_count, 1);

    // Exactly one other goal exists: the child, carrying the parent's
    // deadline.
    let mut conn = engine.pool.acquire().await.unwrap();
    let child_ids = db::get_precondition_ids(&mut *conn, parent.id).await.unwrap();
    assert_eq!(child_ids.len(), 1);
    let child = engine.goal(child_ids[0]).await;
    assert_eq!(child.deadline, parent_row.deadline);

    // Drive the pair to completion.
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();
    assert_eq!(engine.goal(child.id).await.state, GoalState::Achieved);
    assert_eq!(engine.goal(parent.id).await.waiting_for_count, 0);

    engine.teardown().await;
}

#[tokio::test]
async fn any_mode_yield_without_preconditions_resets_the_wait() {
    let engine = setup().await;

    // An any-mode goal with one achieved and one open precondition.
    let open = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
        .await
        .unwrap();
    let done = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
        .await
        .unwrap();
    let mut conn = engine.pool.acquire().await.unwrap();
    db::update_goal_state(&mut *conn, done.id, GoalState::Achieved)
        .await
        .unwrap();
    let done = engine.goal(done.id).await;
    drop(conn);

    let mut spec = ScheduleSpec::new("yield");
    spec.preconditions_mode = PreconditionsMode::Any;
    spec.precondition_goals = vec![open.clone(), done];
    let goal = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    force_waiting_for_worker(&engine, goal.id).await;
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();

    // One precondition is still unachieved, so the goal waits for
    // exactly one thing.
    assert_eq!(engine.goal(goal.id).await.waiting_for_count, 1);

    // Once everything is achieved, a yield leaves nothing to wait for.
    let mut conn = engine.pool.acquire().await.unwrap();
    db::update_goal_state(&mut *conn, open.id, GoalState::Achieved)
        .await
        .unwrap();
    db::apply_achieved_to_dependents(&mut *conn, &[open.id])
        .await
        .unwrap();
    drop(conn);

    force_waiting_for_worker(&engine, goal.id).await;
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();
    assert_eq!(engine.goal(goal.id).await.waiting_for_count, 0);

    engine.teardown().await;
}

#[tokio::test]
async fn database_error_in_handler_still_records_failed_progress() {
    let engine = setup().await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("db-error"))
        .await
        .unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .expect("dispatch should survive the handler's database error");
    assert!(!progress.success);

    // The savepoint rolled the handler's write back; the goal follows the
    // ordinary retry path.
    let row = engine.goal(goal.id).await;
    assert_eq!(row.state, GoalState::WaitingForDate);

    let mut conn = engine.pool.acquire().await.unwrap();
    assert_eq!(progress::count_failures(&mut *conn, goal.id).await.unwrap(), 1);

    engine.teardown().await;
}

#[tokio::test]
async fn unknown_handler_is_a_failure_with_backoff() {
    let engine = setup().await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("no-such-handler"))
        .await
        .unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(!progress.success);
    assert!(progress.message.contains("no-such-handler"));
    assert_eq!(engine.goal(goal.id).await.state, GoalState::WaitingForDate);

    engine.teardown().await;
}

#[tokio::test]
async fn max_progress_count_overrides_even_successful_outcomes() {
    let mut settings = test_settings();
    settings.max_progress_count = Some(1);
    let engine = setup_with(stock_registry(), settings).await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("yield"))
        .await
        .unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(progress.success, "the yield itself is still a success");

    let row = engine.goal(goal.id).await;
    assert_eq!(row.state, GoalState::GivenUp);

    let mut conn = engine.pool.acquire().await.unwrap();
    assert_eq!(progress::count_progress(&mut *conn, goal.id).await.unwrap(), 1);

    engine.teardown().await;
}

#[tokio::test]
async fn max_progress_count_spares_achieved_goals() {
    let mut settings = test_settings();
    settings.max_progress_count = Some(1);
    let engine = setup_with(stock_registry(), settings).await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
        .await
        .unwrap();
    engine.dispatcher.handle_waiting_for_worker(None).await.unwrap().unwrap();
    assert_eq!(engine.goal(goal.id).await.state, GoalState::Achieved);

    engine.teardown().await;
}

#[tokio::test]
async fn repeated_pickups_terminate_a_killer_task() {
    let engine = setup().await; // max_pickups = 3

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
        .await
        .unwrap();
    let mut spec = ScheduleSpec::new("noop");
    spec.precondition_goals = vec![goal.clone()];
    let dependent = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    // Three pickups left behind by crashed workers.
    for _ in 0..3 {
        goalpost_db::queries::pickups::insert_pickup(&engine.pool, goal.id)
            .await
            .unwrap();
    }

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(!progress.success);
    assert!(progress.message.contains("killer task"));

    assert_eq!(engine.goal(goal.id).await.state, GoalState::GivenUp);
    assert_eq!(engine.goal(dependent.id).await.waiting_for_failed_count, 1);

    engine.teardown().await;
}

#[tokio::test]
async fn horizon_limits_what_a_dispatcher_picks() {
    let engine = setup().await;

    let mut spec = ScheduleSpec::new("noop");
    spec.deadline = Some(Utc::now() + Duration::hours(5));
    let goal = schedule(&engine.pool, &engine.settings, spec).await.unwrap();

    // A dispatcher with a 30-minute horizon must not pick it.
    let result = engine
        .dispatcher
        .handle_waiting_for_worker(Some(Duration::minutes(30)))
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(engine.goal(goal.id).await.state, GoalState::WaitingForWorker);

    // A horizon-free dispatcher picks it.
    let result = engine.dispatcher.handle_waiting_for_worker(None).await.unwrap();
    assert!(result.is_some());
    assert_eq!(engine.goal(goal.id).await.state, GoalState::Achieved);

    engine.teardown().await;
}

#[tokio::test]
async fn time_limit_fails_slow_handlers() {
    struct Sleeps;

    #[async_trait]
    impl Handler for Sleeps {
        async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            Ok(HandlerOutcome::AllDone)
        }
    }

    let mut registry = stock_registry();
    registry.register("sleeps", Sleeps);
    let mut settings = test_settings();
    settings.time_limit_seconds = Some(1);
    let engine = setup_with(registry, settings).await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("sleeps"))
        .await
        .unwrap();

    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(!progress.success);
    assert!(progress.message.contains("time limit"));
    assert_eq!(engine.goal(goal.id).await.state, GoalState::WaitingForDate);

    engine.teardown().await;
}

// The address-space cap is process-wide, so this is kept out of the
// default run: `cargo test -- --ignored` exercises it.
#[cfg(unix)]
#[tokio::test]
#[ignore]
async fn memory_limit_fails_hungry_handlers() {
    struct Allocates;

    #[async_trait]
    impl Handler for Allocates {
        async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
            let mut buf: Vec<u8> = Vec::new();
            buf.try_reserve_exact(128 * 1024 * 1024)
                .map_err(|e| anyhow::anyhow!("allocation failed: {e}"))?;
            buf.resize(128 * 1024 * 1024, 0);
            Ok(HandlerOutcome::AllDone)
        }
    }

    let mut registry = stock_registry();
    registry.register("allocates", Allocates);
    let mut settings = test_settings();
    settings.memory_limit_mib = Some(128);
    let engine = setup_with(registry, settings).await;

    let goal = schedule(&engine.pool, &engine.settings, ScheduleSpec::new("allocates"))
        .await
        .unwrap();
    let progress = engine
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(!progress.success);
    assert_eq!(engine.goal(goal.id).await.state, GoalState::WaitingForDate);

    // With a roomier cap the same handler succeeds.
    let mut settings = engine.settings.clone();
    settings.memory_limit_mib = Some(1024);
    let registry = {
        let mut r = stock_registry();
        r.register("allocates", Allocates);
        r
    };
    let relaxed = setup_with(registry, settings).await;
    let goal2 = schedule(&relaxed.pool, &relaxed.settings, ScheduleSpec::new("allocates"))
        .await
        .unwrap();
    let progress = relaxed
        .dispatcher
        .handle_waiting_for_worker(None)
        .await
        .unwrap()
        .unwrap();
    assert!(progress.success);
    assert_eq!(relaxed.goal(goal2.id).await.state, GoalState::Achieved);

    relaxed.teardown().await;
    let _ = goal;
    engine.teardown().await;
}

#[tokio::test]
async fn concurrent_dispatchers_each_get_a_distinct_goal() {
    let engine = setup().await;

    for _ in 0..2 {
        schedule(&engine.pool, &engine.settings, ScheduleSpec::new("noop"))
            .await
            .unwrap();
    }

    let d1 = engine.dispatcher.clone();
    let d2 = engine.dispatcher.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { d1.handle_waiting_for_worker(None).await }),
        tokio::spawn(async move { d2.handle_waiting_for_worker(None).await }),
    );
    let p1 = r1.unwrap().unwrap().expect("first dispatcher should get work");
    let p2 = r2.unwrap().unwrap().expect("second dispatcher should get work");
    assert_ne!(p1.goal, p2.goal, "skip-locked should hand out distinct goals");

    let states = db::count_goals_by_state(&engine.pool).await.unwrap();
    let achieved: i64 = states
        .iter()
        .filter(|(s, _)| *s == GoalState::Achieved)
        .map(|(_, n)| *n)
        .sum();
    assert_eq!(achieved, 2);

    engine.teardown().await;
}
