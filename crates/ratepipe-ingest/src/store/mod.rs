//! Per-date fetch metadata
//!
//! The pipeline only needs a point lookup and an upsert keyed by date. The
//! Postgres implementation backs the `ratepipe` binary; the in-memory one
//! backs the test suites and callers that hand their own store to
//! `PipelineContext::new`.
//!
//! Each date's read-then-write is not wrapped in a cross-date transaction.
//! Running two pipelines against the same store at once is unsupported.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryMetadataStore;
pub use postgres::PgMetadataStore;

/// Metadata store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Store rejected the operation for another reason
    #[error("{0}")]
    Rejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One row of `metadata_tbl`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FetchMetadata {
    pub file_date: NaiveDate,
    pub hash: String,
}

/// Lookup/upsert access to fetch metadata
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Metadata row for `date`, if one was ever stored
    async fn get(&self, date: NaiveDate) -> StoreResult<Option<FetchMetadata>>;

    /// Insert or replace the hash stored for `date`
    async fn upsert(&self, date: NaiveDate, hash: &str) -> StoreResult<()>;

    /// Stored hash for `date`
    async fn get_hash(&self, date: NaiveDate) -> StoreResult<Option<String>> {
        Ok(self.get(date).await?.map(|row| row.hash))
    }

    /// Release held connections; the store is unusable afterwards
    async fn close(&self) {}
}
