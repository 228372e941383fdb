//! Raw JSON → Parquet conversion
//!
//! The raw payload carries a series of `[timestamp_ms, rate]` pairs under a
//! configurable key (`prices` by default). Each pair becomes one row with a
//! UTC millisecond timestamp and a `Float64` rate. Every date's rows are
//! materialized in memory and written as a single row group.

use arrow::array::{ArrayRef, Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::DateError;
use crate::paths::{temp_path, PathResolver};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const RATE_COLUMN: &str = "rate";

/// One price point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRow {
    /// Milliseconds since the unix epoch, UTC
    pub timestamp_ms: i64,
    pub rate: f64,
}

/// Result of converting one date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutcome {
    pub rows: usize,
    pub path: PathBuf,
}

/// Arrow schema of every processed file
pub fn rate_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            TIMESTAMP_COLUMN,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new(RATE_COLUMN, DataType::Float64, false),
    ]))
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f.trunc() as i64)
    })
}

/// Flatten `payload[series_key]` into rows
pub fn parse_rows(date: NaiveDate, payload: &Value, series_key: &str) -> Result<Vec<RateRow>, DateError> {
    let malformed = |reason: String| DateError::MalformedPayload { date, reason };

    let series = payload
        .get(series_key)
        .ok_or_else(|| malformed(format!("missing '{}' series", series_key)))?
        .as_array()
        .ok_or_else(|| malformed(format!("'{}' is not an array", series_key)))?;

    series
        .iter()
        .enumerate()
        .map(|(index, point)| match point.as_array().map(Vec::as_slice) {
            Some([ts, rate]) => match (timestamp_ms(ts), rate.as_f64()) {
                (Some(timestamp_ms), Some(rate)) => Ok(RateRow { timestamp_ms, rate }),
                _ => Err(malformed(format!(
                    "'{}'[{}] is not a numeric [timestamp, rate] pair",
                    series_key, index
                ))),
            },
            _ => Err(malformed(format!(
                "'{}'[{}] is not a [timestamp, rate] pair",
                series_key, index
            ))),
        })
        .collect()
}

/// Columnar batch for `rows` using [`rate_schema`]
pub fn rows_to_batch(rows: &[RateRow]) -> Result<RecordBatch, ArrowError> {
    let timestamps = TimestampMillisecondArray::from_iter_values(rows.iter().map(|r| r.timestamp_ms))
        .with_timezone("UTC");
    let rates = Float64Array::from_iter_values(rows.iter().map(|r| r.rate));

    RecordBatch::try_new(
        rate_schema(),
        vec![Arc::new(timestamps) as ArrayRef, Arc::new(rates) as ArrayRef],
    )
}

/// Write `batch` to `path` through a temp file, replacing any existing file
///
/// On failure the temp file is removed and any previous file is left as is.
fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<(), ParquetError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    let result = write_batch(&tmp, batch)
        .and_then(|()| std::fs::rename(&tmp, path).map_err(ParquetError::from));
    if result.is_err() && tmp.is_file() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<(), ParquetError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Read a processed file back into rows
pub fn read_processed(path: &Path) -> Result<Vec<RateRow>, ParquetError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    let mut rows = Vec::new();

    for batch in reader {
        let batch = batch?;
        let timestamps = batch
            .column_by_name(TIMESTAMP_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
            .ok_or_else(|| ParquetError::General(format!("missing '{}' column", TIMESTAMP_COLUMN)))?;
        let rates = batch
            .column_by_name(RATE_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .ok_or_else(|| ParquetError::General(format!("missing '{}' column", RATE_COLUMN)))?;

        rows.extend(
            timestamps
                .values()
                .iter()
                .zip(rates.values().iter())
                .map(|(&timestamp_ms, &rate)| RateRow { timestamp_ms, rate }),
        );
    }

    Ok(rows)
}

/// Converts raw records into processed records
///
/// Cheap to clone; each conversion runs on the blocking pool with its own copy.
#[derive(Debug, Clone)]
pub struct Transformer {
    paths: PathResolver,
    series_key: String,
}

impl Transformer {
    pub fn new(paths: PathResolver, series_key: impl Into<String>) -> Self {
        Self {
            paths,
            series_key: series_key.into(),
        }
    }

    /// Convert the raw record of `date` (blocking)
    pub fn transform(&self, date: NaiveDate) -> Result<TransformOutcome, DateError> {
        let raw_path = self.paths.raw_path(date);
        let processed_path = self.paths.processed_path(date);

        let raw = std::fs::read(&raw_path).map_err(|e| DateError::Conversion {
            date,
            reason: format!("cannot read '{}': {}", raw_path.display(), e),
        })?;
        let payload: Value = serde_json::from_slice(&raw).map_err(|e| DateError::Conversion {
            date,
            reason: format!("invalid JSON in '{}': {}", raw_path.display(), e),
        })?;

        let rows = parse_rows(date, &payload, &self.series_key)?;
        let batch = rows_to_batch(&rows).map_err(|e| DateError::Conversion {
            date,
            reason: e.to_string(),
        })?;

        write_parquet(&processed_path, &batch).map_err(|e| DateError::Conversion {
            date,
            reason: format!("cannot write '{}': {}", processed_path.display(), e),
        })?;

        info!(
            date = %date,
            rows = rows.len(),
            path = %processed_path.display(),
            "converted JSON to Parquet for date {}",
            date
        );

        Ok(TransformOutcome {
            rows: rows.len(),
            path: processed_path,
        })
    }

    /// Convert `date` on the blocking thread pool
    pub async fn transform_blocking(&self, date: NaiveDate) -> Result<TransformOutcome, DateError> {
        let transformer = self.clone();
        // Blocking threads have no subscriber of their own; keep the caller's
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || transformer.transform(date))
        })
        .await
        .map_err(|e| DateError::Conversion {
            date,
            reason: format!("conversion task failed: {}", e),
        })?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    #[test]
    fn test_parse_rows_accepts_ints_and_floats() {
        let payload = json!({
            "prices": [[1709769600000_i64, 66000.5], [1709773200123.9, 66100]],
            "market_caps": []
        });
        let rows = parse_rows(date(), &payload, "prices").unwrap();

        assert_eq!(
            rows,
            vec![
                RateRow { timestamp_ms: 1709769600000, rate: 66000.5 },
                RateRow { timestamp_ms: 1709773200123, rate: 66100.0 },
            ]
        );
    }

    #[test]
    fn test_parse_rows_missing_series() {
        let err = parse_rows(date(), &json!({"rates": []}), "prices").unwrap_err();
        assert!(matches!(err, DateError::MalformedPayload { .. }));
        assert!(err.to_string().contains("missing 'prices'"));
    }

    #[test]
    fn test_parse_rows_rejects_bad_points() {
        for payload in [
            json!({"prices": {"a": 1}}),
            json!({"prices": [[1, 2, 3]]}),
            json!({"prices": [["x", 1.0]]}),
            json!({"prices": [[1, null]]}),
        ] {
            let err = parse_rows(date(), &payload, "prices").unwrap_err();
            assert_eq!(err.kind(), "malformed_payload", "payload: {}", payload);
        }
    }

    #[test]
    fn test_batch_matches_schema() {
        let rows = [RateRow { timestamp_ms: 1, rate: 2.0 }];
        let batch = rows_to_batch(&rows).unwrap();

        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema(), rate_schema());
    }

    #[test]
    fn test_transform_round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path().join("raw"), dir.path().join("processed"));
        let transformer = Transformer::new(paths.clone(), "prices");
        let raw_path = paths.raw_path(date());
        std::fs::create_dir_all(raw_path.parent().unwrap()).unwrap();

        std::fs::write(&raw_path, r#"{"prices":[[1000,1.5],[2000,1.25],[2000,1.25]]}"#).unwrap();
        let outcome = transformer.transform(date()).unwrap();
        assert_eq!(outcome.rows, 3);
        assert_eq!(outcome.path, paths.processed_path(date()));

        // Duplicate points in the source stay duplicated, nothing is dropped
        let rows = read_processed(&outcome.path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], rows[2]);

        std::fs::write(&raw_path, r#"{"prices":[[3000,9.0]]}"#).unwrap();
        transformer.transform(date()).unwrap();
        assert_eq!(
            read_processed(&outcome.path).unwrap(),
            vec![RateRow { timestamp_ms: 3000, rate: 9.0 }]
        );
    }

    #[test]
    fn test_empty_series_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path().join("raw"), dir.path().join("processed"));
        let raw_path = paths.raw_path(date());
        std::fs::create_dir_all(raw_path.parent().unwrap()).unwrap();
        std::fs::write(&raw_path, r#"{"prices":[]}"#).unwrap();

        let outcome = Transformer::new(paths, "prices").transform(date()).unwrap();
        assert_eq!(outcome.rows, 0);
        assert!(read_processed(&outcome.path).unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path().join("raw"), dir.path().join("processed"));
        let raw_path = paths.raw_path(date());
        std::fs::create_dir_all(raw_path.parent().unwrap()).unwrap();
        std::fs::write(&raw_path, r#"{"prices":[[1000,1.5]]}"#).unwrap();

        // A non-empty directory where the Parquet file should go
        let processed_path = paths.processed_path(date());
        std::fs::create_dir_all(processed_path.join("occupied")).unwrap();

        let err = Transformer::new(paths, "prices").transform(date()).unwrap_err();
        assert_eq!(err.kind(), "conversion");
        assert!(!temp_path(&processed_path).exists());
    }

    #[test]
    fn test_unreadable_raw_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path().join("raw"), dir.path().join("processed"));
        let transformer = Transformer::new(paths.clone(), "prices");

        let missing = transformer.transform(date()).unwrap_err();
        assert_eq!(missing.kind(), "conversion");

        let raw_path = paths.raw_path(date());
        std::fs::create_dir_all(raw_path.parent().unwrap()).unwrap();
        std::fs::write(&raw_path, "{truncated").unwrap();
        let invalid = transformer.transform(date()).unwrap_err();
        assert_eq!(invalid.kind(), "conversion");
        assert!(!paths.processed_path(date()).exists());
    }
}
