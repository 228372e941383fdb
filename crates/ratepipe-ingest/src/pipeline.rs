//! Run orchestration
//!
//! A run has two phases over the same date range:
//!
//! 1. **Extract**: every date is fetched and deduplicated concurrently, bounded
//!    by `max_concurrent_requests`.
//! 2. **Transform**: dates whose raw record changed in this run, plus dates
//!    whose processed file is missing, are converted to Parquet on the
//!    blocking pool, bounded by `max_concurrent_transforms`.
//!
//! Failures are isolated per date. A failed extract skips that date's
//! transform and never affects other dates.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info};

use crate::context::PipelineContext;
use crate::dates::DateRange;
use crate::error::DateError;
use crate::extract::{ExtractOutcome, Extractor};
use crate::transform::{TransformOutcome, Transformer};

/// Everything that happened to one date
#[derive(Debug)]
pub struct DateReport {
    pub date: NaiveDate,
    pub extract: Result<ExtractOutcome, DateError>,
    /// `None` when the date needed no conversion or extraction failed
    pub transform: Option<Result<TransformOutcome, DateError>>,
}

impl DateReport {
    pub fn is_failed(&self) -> bool {
        self.extract.is_err() || matches!(self.transform, Some(Err(_)))
    }

    /// First error recorded for this date
    pub fn error(&self) -> Option<&DateError> {
        match (&self.extract, &self.transform) {
            (Err(e), _) => Some(e),
            (Ok(_), Some(Err(e))) => Some(e),
            _ => None,
        }
    }
}

/// Per-date reports of a run, in date-range order
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<DateReport>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    pub fn uploaded(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.extract, Ok(ExtractOutcome::Uploaded { .. })))
            .count()
    }

    pub fn already_uploaded(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.extract, Ok(ExtractOutcome::AlreadyUploaded { .. })))
            .count()
    }

    pub fn converted(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.transform, Some(Ok(_))))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_failed()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DateError> {
        self.reports.iter().filter_map(DateReport::error)
    }

    pub fn report(&self, date: NaiveDate) -> Option<&DateReport> {
        self.reports.iter().find(|r| r.date == date)
    }
}

pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Extract then transform every date in `range`
    ///
    /// Never fails as a whole: per-date errors are reported in the summary.
    /// The store stays open so a pipeline can run again; release it with
    /// [`Pipeline::shutdown`].
    pub async fn run(&self, range: &DateRange) -> RunSummary {
        let started = Instant::now();
        info!(
            start = %range.start(),
            end = %range.end(),
            days = range.len(),
            order = %range.order(),
            "Starting exchange rate pipeline run"
        );

        let mut extracted = self.extract_all(range).await;

        let pending: Vec<NaiveDate> = range
            .iter()
            .filter(|date| match extracted.get(date) {
                Some(Ok(ExtractOutcome::Uploaded { .. })) => true,
                Some(Ok(ExtractOutcome::AlreadyUploaded { .. })) => {
                    !self.ctx.paths().processed_path(*date).exists()
                },
                _ => false,
            })
            .collect();

        let mut transformed = self.transform_all(&pending).await;

        let reports: Vec<DateReport> = range
            .iter()
            .filter_map(|date| {
                let extract = extracted.remove(&date)?;
                Some(DateReport {
                    date,
                    extract,
                    transform: transformed.remove(&date),
                })
            })
            .collect();

        let summary = RunSummary { reports };
        for failure in summary.failures() {
            error!(date = %failure.date(), kind = failure.kind(), "{}", failure);
        }

        info!(
            total = summary.total(),
            uploaded = summary.uploaded(),
            already_uploaded = summary.already_uploaded(),
            converted = summary.converted(),
            failed = summary.failed(),
            duration_secs = started.elapsed().as_secs_f64(),
            "Pipeline run complete"
        );

        summary
    }

    async fn extract_all(&self, range: &DateRange) -> HashMap<NaiveDate, Result<ExtractOutcome, DateError>> {
        let concurrency = self.ctx.config().http.max_concurrent_requests.max(1);
        let extractor = Extractor::new(&self.ctx);
        let extractor = &extractor;

        info!("Extracting {} dates (concurrency={})", range.len(), concurrency);

        stream::iter(range.iter())
            .map(|date| async move { (date, extractor.extract(date).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    async fn transform_all(&self, dates: &[NaiveDate]) -> HashMap<NaiveDate, Result<TransformOutcome, DateError>> {
        if dates.is_empty() {
            info!("No dates to convert");
            return HashMap::new();
        }

        let concurrency = self.ctx.config().pipeline.max_concurrent_transforms.max(1);
        let transformer = Transformer::new(
            self.ctx.paths().clone(),
            self.ctx.config().api.series_key.clone(),
        );
        let transformer = &transformer;

        info!("Converting {} dates (concurrency={})", dates.len(), concurrency);

        stream::iter(dates.iter().copied())
            .map(|date| async move { (date, transformer.transform_blocking(date).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    /// Release the context's store connections
    pub async fn shutdown(&self) {
        self.ctx.close().await;
    }
}
