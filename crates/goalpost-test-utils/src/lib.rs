//! Test harness for goalpost's database-backed tests.
//!
//! One PostgreSQL server is shared by every test in a binary; each test
//! gets a throwaway database inside it, migrated through the same
//! [`goalpost_db::pool::migrate`] path production uses. Set
//! `GOALPOST_TEST_PG_URL` to point the harness at an external server;
//! otherwise a container is started on first use via testcontainers.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use goalpost_db::pool;

/// The shared server: its root URL and, when we started it ourselves, the
/// container handle keeping it alive for the life of the test binary.
struct PgServer {
    url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    PG_SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("GOALPOST_TEST_PG_URL") {
                return PgServer {
                    url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("17")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("failed to get container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            PgServer {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await
}

/// One admin connection to the shared server's `postgres` database.
async fn admin_conn() -> PgConnection {
    let url = format!("{}/postgres", server().await.url);
    PgConnection::connect(&url)
        .await
        .expect("failed to connect to admin database")
}

/// A throwaway, fully-migrated engine database.
///
/// Create one per test and call [`TestDb::teardown`] at the end; the
/// database is dropped even if connections are still open.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    pub async fn create() -> Self {
        let name = format!("goalpost_{}", Uuid::new_v4().simple());

        let mut admin = admin_conn().await;
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));
        let _ = admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/{name}", server().await.url))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));

        pool::migrate(&pool)
            .await
            .expect("engine migrations should apply");

        Self { pool, name }
    }

    /// Close the pool and drop the database, forcing out any connection a
    /// sloppy test left behind.
    pub async fn teardown(self) {
        let Self { pool, name } = self;
        pool.close().await;

        let mut admin = admin_conn().await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)").as_str())
            .await;
        let _ = admin.close().await;
    }
}
