//! In-memory metadata store

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{FetchMetadata, MetadataStore, StoreError, StoreResult};

/// Metadata kept in a map, with counters for observing pipeline behaviour
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    rows: Mutex<BTreeMap<NaiveDate, String>>,
    failing: Mutex<BTreeSet<NaiveDate>>,
    upserts: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `rows`
    pub fn with_rows(rows: impl IntoIterator<Item = FetchMetadata>) -> Self {
        let store = Self::default();
        store
            .lock_rows()
            .extend(rows.into_iter().map(|row| (row.file_date, row.hash)));
        store
    }

    /// Number of successful upserts since creation
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// All rows ordered by date
    pub fn snapshot(&self) -> Vec<FetchMetadata> {
        self.lock_rows()
            .iter()
            .map(|(file_date, hash)| FetchMetadata {
                file_date: *file_date,
                hash: hash.clone(),
            })
            .collect()
    }

    /// Whether [`MetadataStore::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock_rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_rows().is_empty()
    }

    /// Make every operation for `date` fail, simulating a broken row or connection
    pub fn fail_on(&self, date: NaiveDate) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(date);
    }

    fn check(&self, date: NaiveDate) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Rejected("store is closed".to_string()));
        }
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(&date) {
            return Err(StoreError::Rejected(format!("injected failure for {}", date)));
        }
        Ok(())
    }

    fn lock_rows(&self) -> MutexGuard<'_, BTreeMap<NaiveDate, String>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, date: NaiveDate) -> StoreResult<Option<FetchMetadata>> {
        self.check(date)?;
        Ok(self.lock_rows().get(&date).map(|hash| FetchMetadata {
            file_date: date,
            hash: hash.clone(),
        }))
    }

    async fn upsert(&self, date: NaiveDate, hash: &str) -> StoreResult<()> {
        self.check(date)?;
        self.lock_rows().insert(date, hash.to_string());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
