//! The `goalpost schedule` command: submit a goal from the command line.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use goalpost_core::{EngineSettings, ScheduleSpec, notify, schedule, schedule_listening};
use goalpost_db::models::{PreconditionFailureBehavior, PreconditionsMode};
use goalpost_db::queries::goals as db;

pub struct ScheduleArgs {
    pub handler: String,
    pub args: Option<String>,
    pub kwargs: Option<String>,
    pub precondition_date: Option<DateTime<Utc>>,
    pub precondition_goals: Vec<Uuid>,
    pub blocked: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub mode: PreconditionsMode,
    pub on_failure: PreconditionFailureBehavior,
    pub listen: bool,
}

pub async fn run_schedule(
    pool: &PgPool,
    settings: &EngineSettings,
    args: &ScheduleArgs,
) -> Result<()> {
    let positional: Vec<serde_json::Value> = match &args.args {
        Some(raw) => serde_json::from_str(raw).context("--args must be a JSON array")?,
        None => Vec::new(),
    };
    let keyword: serde_json::Map<String, serde_json::Value> = match &args.kwargs {
        Some(raw) => serde_json::from_str(raw).context("--kwargs must be a JSON object")?,
        None => serde_json::Map::new(),
    };

    let mut precondition_goals = Vec::with_capacity(args.precondition_goals.len());
    for id in &args.precondition_goals {
        let goal = db::get_goal(pool, *id)
            .await?
            .with_context(|| format!("precondition goal {id} not found"))?;
        precondition_goals.push(goal);
    }

    let mut spec = ScheduleSpec::new(&args.handler);
    spec.args = positional;
    spec.kwargs = keyword;
    spec.precondition_date = args.precondition_date;
    spec.precondition_goals = precondition_goals;
    spec.blocked = args.blocked;
    spec.deadline = args.deadline;
    spec.preconditions_mode = args.mode;
    spec.precondition_failure_behavior = args.on_failure;

    if args.listen {
        if args.blocked {
            bail!("--listen cannot be combined with --blocked");
        }
        let (goal, mut listener) = schedule_listening(pool, settings, spec).await?;
        println!("Scheduled goal {} ({}), waiting for progress...", goal.id, goal.state);

        let notification = notify::wait(&mut listener).await?;
        println!("Goal {} progressed to {}", goal.id, notification.payload());
    } else {
        let goal = schedule(pool, settings, spec).await?;
        println!("Scheduled goal {} ({})", goal.id, goal.state);
    }

    Ok(())
}
