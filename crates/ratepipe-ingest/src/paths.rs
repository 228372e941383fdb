//! Date-partitioned file layout
//!
//! Every date maps to `root/year=Y/month=M/day=D/file.ext`. Month and day
//! are written without zero padding (`month=3`, not `month=03`) for both
//! roots; downstream readers depend on this exact layout.

use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};

/// File name of a raw JSON record inside its partition
pub const RAW_FILE_NAME: &str = "file.json";

/// File name of a processed Parquet record inside its partition
pub const PROCESSED_FILE_NAME: &str = "file.parquet";

/// Partition directory for `date` under `root`
pub fn partition_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(format!("year={}", date.year()))
        .join(format!("month={}", date.month()))
        .join(format!("day={}", date.day()))
}

/// Maps dates to raw and processed file paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    raw_root: PathBuf,
    processed_root: PathBuf,
}

impl PathResolver {
    pub fn new(raw_root: impl Into<PathBuf>, processed_root: impl Into<PathBuf>) -> Self {
        Self {
            raw_root: raw_root.into(),
            processed_root: processed_root.into(),
        }
    }

    pub fn raw_root(&self) -> &Path {
        &self.raw_root
    }

    pub fn processed_root(&self) -> &Path {
        &self.processed_root
    }

    pub fn raw_path(&self, date: NaiveDate) -> PathBuf {
        partition_dir(&self.raw_root, date).join(RAW_FILE_NAME)
    }

    pub fn processed_path(&self, date: NaiveDate) -> PathBuf {
        partition_dir(&self.processed_root, date).join(PROCESSED_FILE_NAME)
    }
}

/// Sibling path used while a file is being written
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `contents` to `path` through a temp file and rename
///
/// Parent directories are created as needed. Readers never observe a
/// partially written file, and a failed write leaves no temp file behind.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);

    let result = match tokio::fs::write(&tmp, contents).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Delete `path`; returns whether a file was there
pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
