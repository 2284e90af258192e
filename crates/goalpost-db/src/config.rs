use std::env;

/// Connection settings for the goal store.
///
/// Besides the URL this carries the pool size, because a worker process
/// multiplexes several consumers over one pool: the transition passes, N
/// dispatchers each holding a row lock for the length of a handler run,
/// the pickup monitor, and any LISTEN connections. Undersizing the pool
/// stalls dispatch behind slow handlers.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL, e.g.
    /// `postgresql://localhost:5432/goalpost`.
    pub database_url: String,
    /// Upper bound on pooled connections per process.
    pub max_connections: u32,
}

impl DbConfig {
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/goalpost";

    /// Enough for a transitions pass plus a handful of dispatchers with
    /// headroom for listeners and the pickup monitor.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Build a config from `GOALPOST_DATABASE_URL` and
    /// `GOALPOST_DB_MAX_CONNECTIONS`, with defaults for whatever is unset.
    pub fn from_env() -> Self {
        let database_url =
            env::var("GOALPOST_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_connections = env::var("GOALPOST_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::DEFAULT_MAX_CONNECTIONS);
        Self {
            database_url,
            max_connections,
        }
    }

    /// Build a config from an explicit URL (tests, CLI flags), keeping the
    /// default pool size.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// The database name named by the URL, with any query string stripped.
    pub fn database_name(&self) -> Option<&str> {
        let tail = self.database_url.rsplit('/').next()?;
        let name = tail.split('?').next().unwrap_or(tail);
        (!name.is_empty()).then_some(name)
    }

    /// The URL up to (not including) the database name. Empty when the URL
    /// has no path component.
    pub fn server_url(&self) -> &str {
        match self.database_url.rfind('/') {
            Some(pos) => &self.database_url[..pos],
            None => &self.database_url,
        }
    }

    /// URL of the `postgres` admin database on the same server, for
    /// statements that cannot run inside the target database (such as
    /// `CREATE DATABASE`).
    pub fn admin_url(&self) -> String {
        format!("{}/postgres", self.server_url())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_is_the_url_tail() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_name(), Some("mydb"));
    }

    #[test]
    fn database_name_ignores_query_params() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mydb?sslmode=disable");
        assert_eq!(cfg.database_name(), Some("mydb"));
    }

    #[test]
    fn database_name_missing_when_url_has_no_path() {
        let cfg = DbConfig::new("postgresql://localhost:5432/");
        assert_eq!(cfg.database_name(), None);
    }

    #[test]
    fn server_and_admin_urls() {
        let cfg = DbConfig::new("postgresql://remotehost:5433/goalpost");
        assert_eq!(cfg.server_url(), "postgresql://remotehost:5433");
        assert_eq!(cfg.admin_url(), "postgresql://remotehost:5433/postgres");
    }

    #[test]
    fn explicit_url_keeps_default_pool_size() {
        let cfg = DbConfig::new("postgresql://remotehost:5433/other");
        assert_eq!(cfg.max_connections, DbConfig::DEFAULT_MAX_CONNECTIONS);
    }
}
