mod config;
mod schedule_cmd;
mod status_cmd;
mod worker_cmds;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use goalpost_core::worker::ThreadSpec;
use goalpost_core::{fsck, scheduler};
use goalpost_db::models::{PreconditionFailureBehavior, PreconditionsMode};
use goalpost_db::pool;

use config::GoalpostConfig;

#[derive(Parser)]
#[command(name = "goalpost", about = "Durable PostgreSQL-backed goal scheduler")]
struct Cli {
    /// Database URL (overrides GOALPOST_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a goalpost config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/goalpost")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the goalpost database (create + migrate)
    DbInit,
    /// Schedule a goal
    Schedule {
        /// Handler name to pursue the goal with
        handler: String,
        /// Positional arguments as a JSON array (e.g. '[1, "x"]')
        #[arg(long)]
        args: Option<String>,
        /// Keyword arguments as a JSON object (e.g. '{"depth": 2}')
        #[arg(long)]
        kwargs: Option<String>,
        /// Earliest pickup instant (RFC 3339)
        #[arg(long)]
        precondition_date: Option<DateTime<Utc>>,
        /// Goal ID that must settle first (repeatable)
        #[arg(long = "precondition-goal")]
        precondition_goals: Vec<Uuid>,
        /// Create the goal pre-blocked
        #[arg(long)]
        blocked: bool,
        /// Deadline (RFC 3339); lower means picked up earlier
        #[arg(long)]
        deadline: Option<DateTime<Utc>>,
        /// How preconditions combine: all | any
        #[arg(long, default_value = "all")]
        mode: PreconditionsMode,
        /// What a failed precondition does: block | proceed
        #[arg(long, default_value = "block")]
        on_failure: PreconditionFailureBehavior,
        /// Wait for the goal's first progress notification
        #[arg(long)]
        listen: bool,
    },
    /// Show one goal (or state counts when no ID is given)
    Status {
        /// Goal ID to show
        goal_id: Option<Uuid>,
    },
    /// Block a waiting goal
    Block {
        /// Goal ID to block
        goal_id: Uuid,
    },
    /// Unblock or retry a failed goal
    UnblockRetry {
        /// Goal ID to unblock
        goal_id: Uuid,
    },
    /// Single-threaded worker loop: transitions then dispatch
    BusyWorker {
        /// Stop after this many handler invocations
        #[arg(long)]
        max_progress_count: Option<u64>,
        /// Exit when no work is available
        #[arg(long)]
        once: bool,
    },
    /// Notification-driven worker
    BlockingWorker,
    /// One transitions task plus dispatcher groups
    ThreadedWorker {
        /// Dispatcher group spec COUNT[:HORIZON], e.g. 4 or 2:30m (repeatable)
        #[arg(long = "threads")]
        threads: Vec<ThreadSpec>,
        /// Exit when every task is idle in the same round
        #[arg(long)]
        once: bool,
    },
    /// Recompute the denormalized precondition counters
    Fsck,
    /// Unblock-retry every given-up goal
    Retry {
        /// Maximum number of goals to retry
        #[arg(long)]
        limit: Option<u64>,
    },
}

/// Execute the `goalpost init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        engine: config::EngineSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `goalpost db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `goalpost db-init` command: create database and migrate.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = GoalpostConfig::resolve(cli_db_url)?;

    println!("Initializing goalpost database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::connect(&resolved.db_config).await?;
    pool::migrate(&db_pool).await?;

    let stats = pool::engine_stats(&db_pool).await?;
    println!("Database ready.");
    println!("  goals:        {}", stats.goals);
    println!("  dependencies: {}", stats.dependencies);
    println!("  progress:     {}", stats.progress);
    println!("  pickups:      {}", stats.pickups);

    db_pool.close().await;
    println!("goalpost db-init complete.");
    Ok(())
}

/// Stop token cancelled on SIGINT/SIGTERM. Running handlers finish their
/// attempt; no new goal is picked up afterwards.
fn shutdown_token() -> CancellationToken {
    let stop = CancellationToken::new();

    let token = stop.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    stop
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Schedule {
            handler,
            args,
            kwargs,
            precondition_date,
            precondition_goals,
            blocked,
            deadline,
            mode,
            on_failure,
            listen,
        } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let schedule_args = schedule_cmd::ScheduleArgs {
                handler,
                args,
                kwargs,
                precondition_date,
                precondition_goals,
                blocked,
                deadline,
                mode,
                on_failure,
                listen,
            };
            let result =
                schedule_cmd::run_schedule(&db_pool, &resolved.settings, &schedule_args).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { goal_id } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, goal_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Block { goal_id } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = scheduler::block(&db_pool, goal_id).await;
            db_pool.close().await;
            result?;
            println!("Goal {goal_id} blocked.");
        }
        Commands::UnblockRetry { goal_id } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = scheduler::unblock_retry(&db_pool, goal_id).await;
            db_pool.close().await;
            result?;
            println!("Goal {goal_id} unblocked for retry.");
        }
        Commands::BusyWorker {
            max_progress_count,
            once,
        } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let stop = shutdown_token();
            let result = worker_cmds::run_busy_worker(
                &db_pool,
                &resolved.settings,
                &stop,
                max_progress_count,
                once,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::BlockingWorker => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let stop = shutdown_token();
            let result =
                worker_cmds::run_blocking_worker(&db_pool, &resolved.settings, &stop).await;
            db_pool.close().await;
            result?;
        }
        Commands::ThreadedWorker { threads, once } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let stop = shutdown_token();
            let result = worker_cmds::run_threaded_worker(
                &db_pool,
                &resolved.settings,
                &stop,
                &threads,
                once,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Fsck => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = fsck::check_fix_all(&db_pool).await;
            db_pool.close().await;
            let report = result?;
            println!("Checked {} goals, fixed {}.", report.checked, report.fixed);
        }
        Commands::Retry { limit } => {
            let resolved = GoalpostConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = scheduler::retry_all_given_up(&db_pool, limit).await;
            db_pool.close().await;
            let count = result?;
            println!("Retried {count} goals.");
        }
    }

    Ok(())
}
