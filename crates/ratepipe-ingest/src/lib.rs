//! Ratepipe Ingest Library
//!
//! Daily exchange-rate ELT: fetch one JSON document per date, keep a content
//! hash per date in Postgres, store the raw JSON in a date-partitioned tree and
//! convert it to Parquet in a mirrored tree.
//!
//! # Example
//!
//! ```no_run
//! use ratepipe_ingest::{Config, DateRange, Pipeline, PipelineContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let range = DateRange::ending_yesterday(7, config.pipeline.date_order)?;
//!
//!     let pipeline = Pipeline::new(PipelineContext::connect(config).await?);
//!     let summary = pipeline.run(&range).await;
//!     pipeline.shutdown().await;
//!
//!     println!("{} dates uploaded", summary.uploaded());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod context;
pub mod dates;
pub mod error;
pub mod extract;
pub mod paths;
pub mod pipeline;
pub mod store;
pub mod transform;

pub use config::Config;
pub use context::PipelineContext;
pub use dates::{DateOrder, DateRange};
pub use error::{DateError, PipelineError};
pub use extract::{ExtractOutcome, Extractor};
pub use paths::PathResolver;
pub use pipeline::{DateReport, Pipeline, RunSummary};
pub use store::{FetchMetadata, InMemoryMetadataStore, MetadataStore, PgMetadataStore};
pub use transform::{TransformOutcome, Transformer};
