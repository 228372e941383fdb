//! Error types for the rate pipeline
//!
//! [`DateError`] covers everything that can go wrong for one date. It is
//! caught at the date-task boundary and turned into an outcome, so one bad
//! date never stops the run. [`PipelineError`] covers startup preconditions
//! and is the only kind that reaches the process exit code.

use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single date's extract or transform step
#[derive(Error, Debug)]
pub enum DateError {
    /// Network failure or non-2xx response, after all retries
    #[error("transport failure for {date} after {attempts} attempt(s): {message}")]
    Transport {
        date: NaiveDate,
        attempts: u32,
        message: String,
    },

    /// Response or raw file does not have the expected shape
    #[error("malformed payload for {date}: {reason}")]
    MalformedPayload { date: NaiveDate, reason: String },

    /// Metadata lookup or upsert failed for this date
    #[error("metadata store error for {date}: {message}")]
    Store { date: NaiveDate, message: String },

    /// Writing the raw or processed file failed
    #[error("file operation failed for {date} at '{}': {source}", path.display())]
    Io {
        date: NaiveDate,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Raw JSON could not be read or encoded as Parquet
    #[error("conversion failed for {date}: {reason}")]
    Conversion { date: NaiveDate, reason: String },
}

impl DateError {
    /// The date this failure belongs to
    pub fn date(&self) -> NaiveDate {
        match self {
            DateError::Transport { date, .. }
            | DateError::MalformedPayload { date, .. }
            | DateError::Store { date, .. }
            | DateError::Io { date, .. }
            | DateError::Conversion { date, .. } => *date,
        }
    }

    /// Short stable name for log fields and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            DateError::Transport { .. } => "transport",
            DateError::MalformedPayload { .. } => "malformed_payload",
            DateError::Store { .. } => "store",
            DateError::Io { .. } => "io",
            DateError::Conversion { .. } => "conversion",
        }
    }

    pub(crate) fn io(date: NaiveDate, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DateError::Io {
            date,
            path: path.into(),
            source,
        }
    }
}

/// Errors that prevent a run from starting
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid date range: days must be at least 1 (got {days})")]
    InvalidRange { days: i64 },

    #[error("Metadata store unavailable after {attempts} attempt(s): {message}. Check DATABASE_URL and that the database is reachable.")]
    StoreUnavailable { attempts: u32, message: String },

    #[error("Metadata schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to prepare directory '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
