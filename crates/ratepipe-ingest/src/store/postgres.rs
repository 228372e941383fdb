//! Postgres-backed metadata store

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

use super::{FetchMetadata, MetadataStore, StoreResult};
use crate::config::DatabaseConfig;
use crate::error::PipelineError;

/// Delay before the first reconnect attempt; doubles on each further attempt.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Metadata store over a `sqlx` connection pool
#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, verify the connection and apply migrations
    ///
    /// Connecting is retried `connect_retries` times. The pipeline cannot
    /// guarantee dedup without the store, so exhausting the retries is fatal.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PipelineError> {
        let pool = create_pool(config).await?;
        let store = Self::new(pool);

        store.migrate().await?;
        Ok(store)
    }

    /// Create `metadata_tbl` if it does not exist
    pub async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// All rows ordered by date
    pub async fn list(&self) -> StoreResult<Vec<FetchMetadata>> {
        let rows = sqlx::query_as::<_, FetchMetadata>(
            "SELECT file_date, hash FROM metadata_tbl ORDER BY file_date",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Build the pool, retrying with exponential backoff while the database is unreachable
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, PipelineError> {
    let options = config.connect_options()?;
    let attempts = config.connect_retries.max(1);
    let mut delay = CONNECT_RETRY_DELAY;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options.clone())
            .await;

        match result {
            Ok(pool) => match health_check(&pool).await {
                Ok(()) => {
                    info!(
                        max_connections = config.max_connections,
                        min_connections = config.min_connections,
                        "Metadata database connection pool created"
                    );
                    return Ok(pool);
                },
                Err(e) => {
                    pool.close().await;
                    last_error = e.to_string();
                },
            },
            Err(e) => last_error = e.to_string(),
        }

        warn!(attempt, max_attempts = attempts, error = %last_error, "Cannot reach metadata database");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(PipelineError::StoreUnavailable {
        attempts,
        message: last_error,
    })
}

pub async fn health_check(pool: &PgPool) -> StoreResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get(&self, date: NaiveDate) -> StoreResult<Option<FetchMetadata>> {
        let row = sqlx::query_as::<_, FetchMetadata>(
            "SELECT file_date, hash FROM metadata_tbl WHERE file_date = $1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert(&self, date: NaiveDate, hash: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata_tbl (file_date, hash)
            VALUES ($1, $2)
            ON CONFLICT (file_date) DO UPDATE SET hash = EXCLUDED.hash
            "#,
        )
        .bind(date)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_database_is_store_unavailable() {
        let config = DatabaseConfig {
            url: Some("postgresql://nobody@127.0.0.1:1/missing".to_string()),
            connect_timeout_secs: 1,
            connect_retries: 1,
            min_connections: 0,
            ..DatabaseConfig::default()
        };

        let err = create_pool(&config).await.unwrap_err();
        assert!(matches!(err, PipelineError::StoreUnavailable { attempts: 1, .. }));
    }

    /// Requires a reachable Postgres in `DATABASE_URL`
    #[tokio::test]
    #[ignore]
    async fn test_roundtrip_against_postgres() {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL").ok(),
            min_connections: 0,
            max_connections: 2,
            ..DatabaseConfig::default()
        };
        let store = PgMetadataStore::connect(&config).await.unwrap();
        let date = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();

        store.upsert(date, "first").await.unwrap();
        store.upsert(date, "second").await.unwrap();

        assert_eq!(store.get_hash(date).await.unwrap().as_deref(), Some("second"));
        assert!(store.list().await.unwrap().iter().any(|r| r.file_date == date));

        sqlx::query("DELETE FROM metadata_tbl WHERE file_date = $1")
            .bind(date)
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;
    }
}
