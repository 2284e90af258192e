use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Open a pool against the configured database, sized per the config.
///
/// The acquire timeout is short on purpose: every engine transaction is
/// brief, so waiting long for a connection means the pool is undersized
/// for the worker topology, and failing fast surfaces that.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// Apply the engine schema migrations shipped with this crate.
///
/// Resolved from the crate source tree at compile time and loaded by a
/// runtime `Migrator`, so building never needs a live database and the
/// binary never needs the migrations installed separately. Safe to call on
/// every startup; applied versions are skipped.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"));
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("engine schema is up to date");
    Ok(())
}

/// Create the configured database if it does not exist yet.
///
/// Issues `CREATE DATABASE` straight away over a single admin connection
/// and treats "already exists" as success, so two processes bootstrapping
/// at once cannot race each other between a check and a create.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;

    // CREATE DATABASE cannot be parameterised; refuse anything that is not
    // a plain identifier rather than interpolating it.
    if !db_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("database name {:?} contains invalid characters", db_name);
    }

    let admin_url = config.admin_url();
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .with_context(|| format!("failed to connect to admin database at {admin_url}"))?;

    let created = match admin.execute(format!("CREATE DATABASE {db_name}").as_str()).await {
        Ok(_) => true,
        Err(err) if is_duplicate_database(&err) => false,
        Err(err) => {
            let _ = admin.close().await;
            return Err(err).with_context(|| format!("failed to create database {db_name}"));
        }
    };

    admin
        .close()
        .await
        .context("failed to close admin connection")?;

    if created {
        info!(db = db_name, "database created");
    } else {
        info!(db = db_name, "database already exists");
    }
    Ok(())
}

/// True for PostgreSQL's duplicate_database error.
fn is_duplicate_database(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("42P04")
    )
}

/// Row counts across the four engine tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub goals: i64,
    pub dependencies: i64,
    pub progress: i64,
    pub pickups: i64,
}

/// Count the rows in each engine table, in one round trip.
///
/// Backs the `goalpost db-init` summary and quick health checks.
pub async fn engine_stats(pool: &PgPool) -> Result<EngineStats> {
    let (goals, dependencies, progress, pickups): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM goals), \
                (SELECT COUNT(*) FROM goal_dependencies), \
                (SELECT COUNT(*) FROM goal_progress), \
                (SELECT COUNT(*) FROM goal_pickups)",
    )
    .fetch_one(pool)
    .await
    .context("failed to count engine tables")?;

    Ok(EngineStats {
        goals,
        dependencies,
        progress,
        pickups,
    })
}
