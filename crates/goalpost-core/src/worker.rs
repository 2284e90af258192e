//! Worker runtimes: the busy loop, the notification-driven blocking loop,
//! and the multi-task runtime with horizon-scoped dispatchers.
//!
//! All serialization lives in the database; any number of workers of any
//! flavor can run against the same store.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::notify;
use crate::transitions;

/// Outcome of one worker turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnStats {
    /// All state changes made, including dispatches.
    pub transitions: u64,
    /// Handler invocations only.
    pub progress: u64,
}

/// One full worker turn: the four transition passes, then dispatch until
/// dry (bounded by `max_progress`), then a retention batch.
pub async fn worker_turn(
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
    stop: &CancellationToken,
    max_progress: u64,
) -> Result<TurnStats> {
    let pool = dispatcher.pool();
    let mut stats = TurnStats::default();

    stats.transitions += transitions::handle_waiting_for_date(pool, now).await?;
    stats.transitions += transitions::handle_waiting_for_preconditions(pool).await?;
    stats.transitions += transitions::handle_waiting_for_failed_preconditions(pool).await?;
    stats.transitions += transitions::handle_unblocked_goals(pool).await?;

    while !stop.is_cancelled() && stats.progress < max_progress {
        match dispatcher.handle_waiting_for_worker(None).await? {
            Some(_) => {
                stats.transitions += 1;
                stats.progress += 1;
            }
            None => break,
        }
    }

    transitions::remove_old_goals(pool, dispatcher.settings(), now).await?;
    Ok(stats)
}

/// Options for [`busy_worker`].
#[derive(Debug, Clone, Default)]
pub struct BusyWorkerOptions {
    /// Exit as soon as a full turn finds nothing to do.
    pub once: bool,
    /// Stop after this many handler invocations across the whole run.
    pub max_progress_count: Option<u64>,
}

/// Single-threaded worker: keep taking turns, sleeping ~1s when idle.
pub async fn busy_worker(
    dispatcher: &Dispatcher,
    stop: &CancellationToken,
    options: &BusyWorkerOptions,
) -> Result<()> {
    info!("busy-wait worker started");
    let mut progress_count = 0u64;

    while !stop.is_cancelled() {
        let budget = match options.max_progress_count {
            Some(max) => {
                let remaining = max.saturating_sub(progress_count);
                if remaining == 0 {
                    info!(max, "max progress count reached, exiting");
                    break;
                }
                remaining
            }
            None => u64::MAX,
        };

        let stats = worker_turn(dispatcher, Utc::now(), stop, budget).await?;
        progress_count += stats.progress;

        if stats.transitions == 0 && stats.progress == 0 {
            if options.once {
                info!("nothing to do, exiting because of `once` flag");
                break;
            }
            debug!("nothing to do, sleeping for a bit");
            idle_sleep(stop).await;
        }
    }

    info!("busy-wait worker exiting");
    Ok(())
}

/// Notification-driven worker: listen first, drain the backlog that
/// existed before we were listening, then dispatch once per notification.
pub async fn blocking_worker(dispatcher: &Dispatcher, stop: &CancellationToken) -> Result<()> {
    info!("blocking worker started, registering listener (goal_waiting_for_worker)");
    let mut listener = notify::listen_goal_waiting_for_worker(dispatcher.pool()).await?;

    info!("executing work ready before we were listening");
    while !stop.is_cancelled() {
        if dispatcher.handle_waiting_for_worker(None).await?.is_none() {
            break;
        }
    }

    info!("handling notifications");
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            received = listener.recv() => {
                received.context("notification listener failed")?;
                // We might pick a different goal than the one notified.
                // That is fine: there are at least as many notifications
                // as there are goals to pick.
                dispatcher.handle_waiting_for_worker(None).await?;
            }
        }
    }

    info!("blocking worker exiting");
    Ok(())
}

// -----------------------------------------------------------------------
// Threaded worker
// -----------------------------------------------------------------------

/// A dispatcher group spec: `COUNT[:HORIZON]`, e.g. `4` or `2:30m`.
///
/// Dispatchers with a horizon only pick goals whose deadline falls within
/// it, so fast-lane workers are not starved by long-horizon backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSpec {
    pub count: usize,
    pub deadline_horizon: Option<Duration>,
}

impl FromStr for ThreadSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (count_str, horizon) = match s.split_once(':') {
            Some((count, horizon)) => (count, Some(parse_duration(horizon)?)),
            None => (s, None),
        };
        let count: usize = count_str
            .parse()
            .with_context(|| format!("invalid thread count {count_str:?}"))?;
        if count == 0 {
            bail!("thread count must be positive");
        }
        Ok(Self {
            count,
            deadline_horizon: horizon,
        })
    }
}

/// Parse a duration like `90s`, `30m`, `12h`, `1d`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let (number, unit) = s.split_at(s.len().saturating_sub(1));
    let value: i64 = number
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        _ => bail!("invalid duration {s:?} (expected a number with s/m/h/d suffix)"),
    }
}

/// Run one transitions task plus the dispatcher groups described by
/// `specs`. With `once`, exits when every task reports idle in the same
/// round.
pub async fn threaded_worker(
    dispatcher: &Dispatcher,
    specs: &[ThreadSpec],
    once: bool,
    stop: &CancellationToken,
) -> Result<()> {
    let dispatch_members: Vec<Option<Duration>> = specs
        .iter()
        .flat_map(|spec| std::iter::repeat_n(spec.deadline_horizon, spec.count))
        .collect();
    if dispatch_members.is_empty() {
        bail!("at least one dispatch thread is required");
    }

    // Members: transitions task plus every dispatcher.
    let idle = Arc::new(IdleTracker::new(dispatch_members.len() + 1, once, stop.clone()));
    info!(dispatchers = dispatch_members.len(), once, "threaded worker started");

    let mut tasks = tokio::task::JoinSet::new();

    {
        let dispatcher = dispatcher.clone();
        let stop = stop.clone();
        let idle = idle.clone();
        tasks.spawn(async move { transitions_loop(&dispatcher, &stop, &idle, 0).await });
    }

    for (i, horizon) in dispatch_members.into_iter().enumerate() {
        let dispatcher = dispatcher.clone();
        let stop = stop.clone();
        let idle = idle.clone();
        tasks.spawn(async move { dispatch_loop(&dispatcher, horizon, &stop, &idle, i + 1).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("worker task panicked")? {
            Ok(()) => {}
            Err(err) => {
                error!(err = format!("{err:#}"), "worker task failed");
                stop.cancel();
                first_error.get_or_insert(err);
            }
        }
    }

    info!("threaded worker exiting");
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// The transitions member: date/precondition/unblock passes plus
/// retention, in a loop.
async fn transitions_loop(
    dispatcher: &Dispatcher,
    stop: &CancellationToken,
    idle: &IdleTracker,
    member: usize,
) -> Result<()> {
    let pool = dispatcher.pool();
    while !stop.is_cancelled() {
        let now = Utc::now();
        let mut transitions = 0;
        transitions += transitions::handle_waiting_for_date(pool, now).await?;
        transitions += transitions::handle_waiting_for_preconditions(pool).await?;
        transitions += transitions::handle_waiting_for_failed_preconditions(pool).await?;
        transitions += transitions::handle_unblocked_goals(pool).await?;
        transitions += transitions::remove_old_goals(pool, dispatcher.settings(), now).await?;

        if transitions == 0 {
            idle.report_idle(member);
            idle_sleep(stop).await;
        } else {
            idle.report_busy();
        }
    }
    Ok(())
}

/// One dispatcher member. Sleeps ~1s when there is no work, but a
/// `goal_waiting_for_worker` notification ends the sleep early.
async fn dispatch_loop(
    dispatcher: &Dispatcher,
    deadline_horizon: Option<Duration>,
    stop: &CancellationToken,
    idle: &IdleTracker,
    member: usize,
) -> Result<()> {
    let mut listener = notify::listen_goal_waiting_for_worker(dispatcher.pool())
        .await
        .ok();

    while !stop.is_cancelled() {
        match dispatcher.handle_waiting_for_worker(deadline_horizon).await {
            Ok(Some(_)) => idle.report_busy(),
            Ok(None) => {
                idle.report_idle(member);
                match listener.as_mut() {
                    Some(listener) => {
                        tokio::select! {
                            () = idle_sleep(stop) => {}
                            _ = listener.recv() => {}
                        }
                    }
                    None => idle_sleep(stop).await,
                }
            }
            Err(err) => {
                // Keep the dispatcher alive through transient database
                // trouble; the pickup trail covers repeated crashes.
                error!(err = format!("{err:#}"), "dispatch step failed");
                idle.report_busy();
                idle_sleep(stop).await;
            }
        }
    }
    Ok(())
}

/// Tracks which members found no work. With `once`, cancels the stop
/// token when every member is idle in the same round; any member that
/// does work clears the set, since its work may have unblocked others.
struct IdleTracker {
    total: usize,
    once: bool,
    stop: CancellationToken,
    idle: Mutex<HashSet<usize>>,
}

impl IdleTracker {
    fn new(total: usize, once: bool, stop: CancellationToken) -> Self {
        Self {
            total,
            once,
            stop,
            idle: Mutex::new(HashSet::new()),
        }
    }

    fn report_idle(&self, member: usize) {
        if !self.once {
            return;
        }
        let mut idle = self.idle.lock().expect("idle tracker lock poisoned");
        idle.insert(member);
        if idle.len() == self.total {
            info!("all worker members idle, exiting");
            self.stop.cancel();
        }
    }

    fn report_busy(&self) {
        if !self.once {
            return;
        }
        self.idle.lock().expect("idle tracker lock poisoned").clear();
    }
}

/// Sleep ~1s, jittered +/-10% to spread workers out, ending early on stop.
async fn idle_sleep(stop: &CancellationToken) {
    let millis = rand::rng().random_range(900..=1100);
    tokio::select! {
        () = stop.cancelled() => {}
        () = tokio::time::sleep(StdDuration::from_millis(millis)) => {}
    }
}
