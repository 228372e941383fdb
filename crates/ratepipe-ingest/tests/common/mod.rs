//! Shared fixtures for ratepipe integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::NaiveDate;
use ratepipe_ingest::{
    Config, DateOrder, DateRange, InMemoryMetadataStore, MetadataStore, Pipeline, PipelineContext,
};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

/// Query format the stub API expects (`dd-mm-yyyy`)
pub const QUERY_DATE_FORMAT: &str = "%d-%m-%Y";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// Config pointing at `server` with fast retries and roots under `root`
pub fn test_config(server: &MockServer, root: &Path) -> Config {
    let mut config = Config::default();
    config.api.url_template = format!("{}/history?date={{date}}", server.uri());
    config.api.date_format = QUERY_DATE_FORMAT.to_string();
    config.api.timeout_secs = 5;
    config.http.retries = 3;
    config.http.retry_delay_ms = 1;
    config.http.retry_backoff = 2;
    config.storage.raw_dir = root.join("raw");
    config.storage.processed_dir = root.join("processed");
    config
}

/// Stub API payload for one day
pub fn rates_payload(points: &[(i64, f64)]) -> serde_json::Value {
    serde_json::json!({
        "prices": points.iter().map(|(ts, rate)| serde_json::json!([ts, rate])).collect::<Vec<_>>(),
        "market_caps": [],
        "total_volumes": []
    })
}

/// Midnight UTC of `date` in milliseconds
pub fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
}

/// Serve `body` for `date`
pub async fn mount_day(server: &MockServer, date: NaiveDate, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/history"))
        .and(query_param("date", date.format(QUERY_DATE_FORMAT).to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Answer every request for `date` with `status`
pub async fn mount_status(server: &MockServer, date: NaiveDate, status: u16) {
    Mock::given(method("GET"))
        .and(path("/history"))
        .and(query_param("date", date.format(QUERY_DATE_FORMAT).to_string()))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Temp roots, stub API and in-memory store wired into one pipeline
pub struct Harness {
    pub dir: TempDir,
    pub server: MockServer,
    pub store: Arc<InMemoryMetadataStore>,
    pub config: Config,
}

impl Harness {
    pub async fn start() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let server = MockServer::start().await;
        let config = test_config(&server, dir.path());

        Self {
            dir,
            server,
            store: Arc::new(InMemoryMetadataStore::new()),
            config,
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        let store: Arc<dyn MetadataStore> = self.store.clone();
        let ctx = PipelineContext::new(self.config.clone(), store).expect("Failed to build context");
        Pipeline::new(ctx)
    }

    pub fn range(&self, end: NaiveDate, days: i64) -> DateRange {
        DateRange::ending_at(end, days, DateOrder::Descending).expect("valid range")
    }

    /// Hash currently stored for `date`
    pub fn stored_hash(&self, date: NaiveDate) -> Option<String> {
        self.store
            .snapshot()
            .into_iter()
            .find(|row| row.file_date == date)
            .map(|row| row.hash)
    }

    pub fn raw_path(&self, date: NaiveDate) -> std::path::PathBuf {
        self.config.storage.resolver().raw_path(date)
    }

    pub fn processed_path(&self, date: NaiveDate) -> std::path::PathBuf {
        self.config.storage.resolver().processed_path(date)
    }
}

/// Formatted `tracing` output collected in memory
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(Arc::clone(&self.buf))
    }
}

impl LogCapture {
    /// Start capturing INFO and above on this thread until the guard drops
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Forget everything captured so far
    pub fn clear(&self) {
        self.buf.lock().unwrap().clear();
    }

    /// Byte offset of the first line containing `message`
    pub fn position(&self, message: &str) -> Option<usize> {
        self.contents().find(message)
    }
}
