//! Engine configuration.
//!
//! All knobs come from the environment (`GOALPOST_*`), with the CLI config
//! file layered on top by the binary. A missing optional key disables the
//! corresponding mechanism.

use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;

/// Tunables for the scheduler engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Achieved goals older than this many seconds are deleted by the
    /// retention pass. `None` disables retention.
    pub retention_seconds: Option<u64>,
    /// Per-goal cap on total handler invocations. One more attempt past
    /// the cap flips the goal to given-up. `None` disables the cap.
    pub max_progress_count: Option<i64>,
    /// Prior-failure threshold: give up when `prior_failures + 1` reaches
    /// this value.
    pub give_up_at: i64,
    /// Default deadline distance from now for goals scheduled outside a
    /// handler.
    pub default_deadline_seconds: u64,
    /// Address-space cap applied around each handler invocation.
    /// `None` disables the cap.
    pub memory_limit_mib: Option<u64>,
    /// Wall-clock cap per handler invocation. `None` disables the cap.
    pub time_limit_seconds: Option<u64>,
    /// Pickup count at which a goal is treated as a killer task.
    pub max_pickups: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retention_seconds: Some(30 * 24 * 3600),
            max_progress_count: None,
            give_up_at: 3,
            default_deadline_seconds: 7 * 24 * 3600,
            memory_limit_mib: None,
            time_limit_seconds: None,
            max_pickups: 3,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable setting");
            None
        }
    }
}

impl EngineSettings {
    /// Build settings from `GOALPOST_*` environment variables, falling back
    /// to the defaults for any key that is absent or unparseable.
    ///
    /// Set `GOALPOST_RETENTION_SECONDS=null` (or any non-number) to disable
    /// retention explicitly.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retention_seconds: match env::var("GOALPOST_RETENTION_SECONDS") {
                Ok(v) => v.parse().ok(),
                Err(_) => defaults.retention_seconds,
            },
            max_progress_count: match env::var("GOALPOST_MAX_PROGRESS_COUNT") {
                Ok(v) => v.parse().ok(),
                Err(_) => defaults.max_progress_count,
            },
            give_up_at: parse_var("GOALPOST_GIVE_UP_AT").unwrap_or(defaults.give_up_at),
            default_deadline_seconds: parse_var("GOALPOST_DEFAULT_DEADLINE_SECONDS")
                .unwrap_or(defaults.default_deadline_seconds),
            memory_limit_mib: parse_var("GOALPOST_MEMORY_LIMIT_MIB"),
            time_limit_seconds: parse_var("GOALPOST_TIME_LIMIT_SECONDS"),
            max_pickups: parse_var("GOALPOST_MAX_PICKUPS").unwrap_or(defaults.max_pickups),
        }
    }

    /// Retention window as a chrono duration, if retention is enabled.
    pub fn retention_window(&self) -> Option<Duration> {
        self.retention_seconds.map(|s| Duration::seconds(s as i64))
    }

    /// Default deadline distance as a chrono duration.
    pub fn default_deadline(&self) -> Duration {
        Duration::seconds(self.default_deadline_seconds as i64)
    }

    /// Handler wall-clock cap, if enabled.
    pub fn time_limit(&self) -> Option<StdDuration> {
        self.time_limit_seconds.map(StdDuration::from_secs)
    }
}
