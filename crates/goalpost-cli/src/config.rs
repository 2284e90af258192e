//! Configuration file management for goalpost.
//!
//! Provides a TOML-based config file at `~/.config/goalpost/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use goalpost_core::EngineSettings;
use goalpost_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// Engine knobs; any key left out falls back to the environment, then to
/// the built-in default.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    pub retention_seconds: Option<u64>,
    pub max_progress_count: Option<i64>,
    pub give_up_at: Option<i64>,
    pub default_deadline_seconds: Option<u64>,
    pub memory_limit_mib: Option<u64>,
    pub time_limit_seconds: Option<u64>,
    pub max_pickups: Option<i64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the goalpost config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/goalpost` or
/// `~/.config/goalpost`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("goalpost");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("goalpost")
}

/// Return the path to the goalpost config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct GoalpostConfig {
    pub db_config: DbConfig,
    pub settings: EngineSettings,
}

impl GoalpostConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // DB URL resolution. Pool sizing still comes from the environment.
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("GOALPOST_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let mut db_config = DbConfig::from_env();
        db_config.database_url = db_url;

        // Engine settings: environment first, then the config file fills
        // in what the environment left at its default.
        let mut settings = EngineSettings::from_env();
        if let Some(cfg) = file_config {
            apply_engine_section(&mut settings, &cfg.engine);
        }

        Ok(Self {
            db_config,
            settings,
        })
    }
}

/// Overlay config-file engine keys onto settings, but only where the
/// environment did not already override the default.
fn apply_engine_section(settings: &mut EngineSettings, section: &EngineSection) {
    let defaults = EngineSettings::default();

    if settings.retention_seconds == defaults.retention_seconds {
        if let Some(v) = section.retention_seconds {
            settings.retention_seconds = Some(v);
        }
    }
    if settings.max_progress_count == defaults.max_progress_count {
        if let Some(v) = section.max_progress_count {
            settings.max_progress_count = Some(v);
        }
    }
    if settings.give_up_at == defaults.give_up_at {
        if let Some(v) = section.give_up_at {
            settings.give_up_at = v;
        }
    }
    if settings.default_deadline_seconds == defaults.default_deadline_seconds {
        if let Some(v) = section.default_deadline_seconds {
            settings.default_deadline_seconds = v;
        }
    }
    if settings.memory_limit_mib.is_none() {
        settings.memory_limit_mib = section.memory_limit_mib;
    }
    if settings.time_limit_seconds.is_none() {
        settings.time_limit_seconds = section.time_limit_seconds;
    }
    if settings.max_pickups == defaults.max_pickups {
        if let Some(v) = section.max_pickups {
            settings.max_pickups = v;
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
