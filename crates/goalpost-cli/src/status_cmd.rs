//! The `goalpost status` command: one goal in detail, or state counts
//! across the whole table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use goalpost_db::queries::goals as db;
use goalpost_db::queries::progress;

pub async fn run_status(pool: &PgPool, goal_id: Option<Uuid>) -> Result<()> {
    match goal_id {
        Some(id) => show_goal(pool, id).await,
        None => show_counts(pool).await,
    }
}

async fn show_goal(pool: &PgPool, id: Uuid) -> Result<()> {
    let goal = db::get_goal(pool, id)
        .await?
        .with_context(|| format!("goal {id} not found"))?;

    println!("Goal {}", goal.id);
    println!("  state:              {}", goal.state);
    println!("  handler:            {}", goal.handler);
    println!("  precondition date:  {}", goal.precondition_date);
    println!("  deadline:           {}", goal.deadline);
    println!("  mode / on failure:  {} / {}", goal.preconditions_mode, goal.precondition_failure_behavior);
    println!(
        "  waiting for:        {} ({} not achieved, {} failed)",
        goal.waiting_for_count, goal.waiting_for_not_achieved_count, goal.waiting_for_failed_count
    );
    println!("  created at:         {}", goal.created_at);

    let rows = progress::list_progress(pool, goal.id).await?;
    if rows.is_empty() {
        println!("  no progress recorded");
    } else {
        println!("  progress ({} attempts):", rows.len());
        for row in rows {
            let outcome = if row.success { "ok" } else { "failed" };
            let took = row
                .time_taken_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_owned());
            println!("    {} {:>6} {:>8}  {}", row.created_at, outcome, took, row.message);
        }
    }

    Ok(())
}

async fn show_counts(pool: &PgPool) -> Result<()> {
    let counts = db::count_goals_by_state(pool).await?;
    if counts.is_empty() {
        println!("No goals.");
        return Ok(());
    }

    let total: i64 = counts.iter().map(|(_, n)| *n).sum();
    for (state, count) in &counts {
        let name = state.to_string();
        println!("{name:>28}: {count}");
    }
    println!("{:>28}: {total}", "total");
    Ok(())
}
