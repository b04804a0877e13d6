//! Postgres-backed harness for the sync engine.
//!
//! One container is started per test binary and shared; every test gets its
//! own pair of uniquely named source and survey schemas on it. Set
//! `SWR_TEST_DATABASE_URL` to run against an existing server instead.

use anyhow::{Context, Result};
use sqlx::PgPool;
use swr_sync::{SurveySync, SyncConfig};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedDatabase {
    db_url: String,
    // Keeps the container alive for the whole test binary
    _postgres: Option<ContainerAsync<Postgres>>,
}

static SHARED_DB: OnceCell<SharedDatabase> = OnceCell::const_new();

impl SharedDatabase {
    async fn init() -> Result<Self> {
        // RUST_LOG=swr_sync=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        if let Ok(db_url) = std::env::var("SWR_TEST_DATABASE_URL") {
            return Ok(Self {
                db_url,
                _postgres: None,
            });
        }

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;
        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;

        Ok(Self {
            db_url: format!("postgresql://postgres:postgres@{host}:{port}/postgres"),
            _postgres: Some(postgres),
        })
    }

    async fn get() -> &'static Self {
        SHARED_DB
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test database")
            })
            .await
    }
}

/// A seeded pair of schemas plus the engine configuration pointing at them.
pub struct TestDb {
    pub pool: PgPool,
    pub config: SyncConfig,
}

impl TestDb {
    /// Creates fresh schemas, seeds the reference fixture and the layout registry.
    pub async fn new() -> Result<Self> {
        let shared = SharedDatabase::get().await;
        let pool = PgPool::connect(&shared.db_url)
            .await
            .context("Failed to connect to test database")?;

        let suffix = Uuid::new_v4().simple().to_string();
        let mut config = SyncConfig::from_lookup(|_| None)?;
        config.database_url = shared.db_url.clone();
        config.source_schema = format!("ak_{suffix}");
        config.survey_schema = format!("survey_{suffix}");

        let db = Self { pool, config };
        db.engine()?.init().await?;
        super::seed_reference_fixture(&db).await?;
        Ok(db)
    }

    pub fn engine(&self) -> Result<SurveySync> {
        Ok(SurveySync::new(self.pool.clone(), &self.config)?)
    }

    pub fn source(&self, table: &str) -> String {
        format!("\"{}\".\"{table}\"", self.config.source_schema)
    }

    pub fn survey(&self, table: &str) -> String {
        format!("\"{}\".\"{table}\"", self.config.survey_schema)
    }

    pub async fn cleanup(self) -> Result<()> {
        let sql = format!(
            "DROP SCHEMA IF EXISTS \"{}\" CASCADE; DROP SCHEMA IF EXISTS \"{}\" CASCADE;",
            self.config.source_schema, self.config.survey_schema
        );
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        self.pool.close().await;
        Ok(())
    }
}
