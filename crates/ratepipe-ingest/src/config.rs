//! Configuration management
//!
//! Everything is read from the environment (after loading `.env`), with the
//! defaults below for anything unset.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dates::DateOrder;
use crate::error::PipelineError;
use crate::paths::PathResolver;

// ============================================================================
// API Configuration Constants
// ============================================================================

/// Default endpoint; `{from}`/`{to}` are the unix bounds of the requested day.
pub const DEFAULT_API_URL_TEMPLATE: &str = "https://api.coingecko.com/api/v3/coins/bitcoin/market_chart/range?vs_currency=usd&from={from}&to={to}";

/// `strftime` pattern substituted for `{date}` in the URL template.
pub const DEFAULT_API_DATE_FORMAT: &str = "%d-%m-%Y";

/// JSON key holding the `[timestamp_ms, rate]` series.
pub const DEFAULT_API_SERIES_KEY: &str = "prices";

pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_USER_AGENT: &str = concat!("ratepipe/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// HTTP Retry Constants
// ============================================================================

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 5;

/// Total attempts per date, including the first.
pub const DEFAULT_HTTP_RETRIES: u32 = 5;

pub const DEFAULT_RETRY_DELAY_MS: u64 = 3_000;

/// Multiplier applied to the delay after each failed attempt.
pub const DEFAULT_RETRY_BACKOFF: u32 = 3;

// ============================================================================
// Storage / Database / Pipeline Constants
// ============================================================================

pub const DEFAULT_RAW_DATA_DIR: &str = "./data/raw";
pub const DEFAULT_PROCESSED_DATA_DIR: &str = "./data/processed";

pub const DEFAULT_DATABASE_HOST: &str = "localhost";
pub const DEFAULT_DATABASE_PORT: u16 = 5432;
pub const DEFAULT_DATABASE_NAME: &str = "metadata_db";
pub const DEFAULT_DATABASE_USER: &str = "postgres";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 14;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 7;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DATABASE_CONNECT_RETRIES: u32 = 3;

/// Number of days processed when `--days` is not given.
pub const DEFAULT_DAYS: i64 = 7;

pub const DEFAULT_MAX_CONCURRENT_TRANSFORMS: usize = 4;

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
}

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// URL with `{date}`, `{from}` and/or `{to}` placeholders
    pub url_template: String,
    pub date_format: String,
    pub series_key: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

/// Request concurrency and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub max_concurrent_requests: usize,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: u32,
}

/// Raw and processed roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
}

/// Metadata database configuration
///
/// `url` wins when set; otherwise the connection is assembled from parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub connect_retries: u32,
}

/// Run-level behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub date_order: DateOrder,
    pub max_concurrent_transforms: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_API_URL_TEMPLATE.to_string(),
            date_format: DEFAULT_API_DATE_FORMAT.to_string(),
            series_key: DEFAULT_API_SERIES_KEY.to_string(),
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            retries: DEFAULT_HTTP_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from(DEFAULT_RAW_DATA_DIR),
            processed_dir: PathBuf::from(DEFAULT_PROCESSED_DATA_DIR),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_DATABASE_HOST.to_string(),
            port: DEFAULT_DATABASE_PORT,
            name: DEFAULT_DATABASE_NAME.to_string(),
            user: DEFAULT_DATABASE_USER.to_string(),
            password: None,
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            connect_retries: DEFAULT_DATABASE_CONNECT_RETRIES,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            date_order: DateOrder::default(),
            max_concurrent_transforms: DEFAULT_MAX_CONCURRENT_TRANSFORMS,
        }
    }
}

impl ApiConfig {
    /// Request URL for `date`
    ///
    /// `{date}` becomes the date in `date_format`; `{from}` and `{to}` become
    /// the unix seconds of midnight UTC at the start and end of the day.
    pub fn url_for(&self, date: NaiveDate) -> String {
        let from = date.and_time(NaiveTime::MIN).and_utc().timestamp();
        let to = from + 86_400;

        self.url_template
            .replace("{date}", &date.format(&self.date_format).to_string())
            .replace("{from}", &from.to_string())
            .replace("{to}", &to.to_string())
    }
}

impl HttpConfig {
    /// Sleep before the attempt following failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.retry_backoff).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    /// Upper bound for any single wait between attempts
    ///
    /// One backoff step past the last scheduled retry, which leaves room for
    /// rate-limit jitter while keeping a huge `Retry-After` from stalling a date.
    pub fn max_retry_delay(&self) -> Duration {
        self.backoff_delay(self.retries.max(1))
    }
}

impl StorageConfig {
    pub fn resolver(&self) -> PathResolver {
        PathResolver::new(&self.raw_dir, &self.processed_dir)
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, PipelineError> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url)
                .map_err(|e| PipelineError::Config(format!("invalid DATABASE_URL: {}", e)));
        }

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            default
        }),
        None => default,
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> Result<Self, PipelineError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let defaults = Config::default();
        let string_or = |key: &str, default: String| var(key).unwrap_or(default);

        let config = Config {
            api: ApiConfig {
                url_template: string_or("API_URL_TEMPLATE", defaults.api.url_template),
                date_format: string_or("API_DATE_FORMAT", defaults.api.date_format),
                series_key: string_or("API_SERIES_KEY", defaults.api.series_key),
                timeout_secs: parse_or(
                    var("API_TIMEOUT_SECS"),
                    "API_TIMEOUT_SECS",
                    defaults.api.timeout_secs,
                ),
                user_agent: string_or("API_USER_AGENT", defaults.api.user_agent),
            },
            http: HttpConfig {
                max_concurrent_requests: parse_or(
                    var("HTTP_MAX_CONCURRENT_REQUESTS"),
                    "HTTP_MAX_CONCURRENT_REQUESTS",
                    defaults.http.max_concurrent_requests,
                ),
                retries: parse_or(var("HTTP_RETRIES"), "HTTP_RETRIES", defaults.http.retries),
                retry_delay_ms: parse_or(
                    var("HTTP_RETRY_DELAY_MS"),
                    "HTTP_RETRY_DELAY_MS",
                    defaults.http.retry_delay_ms,
                ),
                retry_backoff: parse_or(
                    var("HTTP_RETRY_BACKOFF"),
                    "HTTP_RETRY_BACKOFF",
                    defaults.http.retry_backoff,
                ),
            },
            storage: StorageConfig {
                raw_dir: var("RAW_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.raw_dir),
                processed_dir: var("PROCESSED_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.processed_dir),
            },
            database: DatabaseConfig {
                url: var("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                host: string_or("HOST_METADATA_DB", defaults.database.host),
                port: parse_or(
                    var("PORT_METADATA_DB"),
                    "PORT_METADATA_DB",
                    defaults.database.port,
                ),
                name: string_or("METADATA_DB", defaults.database.name),
                user: string_or("USER_METADATA_DB", defaults.database.user),
                password: var("PASSWORD_METADATA_DB"),
                max_connections: parse_or(
                    var("DB_MAX_CONNECTIONS"),
                    "DB_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                ),
                min_connections: parse_or(
                    var("DB_MIN_CONNECTIONS"),
                    "DB_MIN_CONNECTIONS",
                    defaults.database.min_connections,
                ),
                connect_timeout_secs: parse_or(
                    var("DB_CONNECT_TIMEOUT"),
                    "DB_CONNECT_TIMEOUT",
                    defaults.database.connect_timeout_secs,
                ),
                connect_retries: parse_or(
                    var("DB_CONNECT_RETRIES"),
                    "DB_CONNECT_RETRIES",
                    defaults.database.connect_retries,
                ),
            },
            pipeline: PipelineConfig {
                date_order: match var("RATEPIPE_DATE_ORDER") {
                    Some(order) => order.parse()?,
                    None => defaults.pipeline.date_order,
                },
                max_concurrent_transforms: parse_or(
                    var("RATEPIPE_MAX_CONCURRENT_TRANSFORMS"),
                    "RATEPIPE_MAX_CONCURRENT_TRANSFORMS",
                    defaults.pipeline.max_concurrent_transforms,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        let template = self.api.url_template.trim();
        if template.is_empty() {
            return invalid("API URL template cannot be empty".to_string());
        }
        if !["{date}", "{from}", "{to}"].iter().any(|p| template.contains(p)) {
            return invalid(format!(
                "API URL template '{}' has no {{date}}, {{from}} or {{to}} placeholder",
                template
            ));
        }
        if self.api.series_key.is_empty() {
            return invalid("API series key cannot be empty".to_string());
        }

        if self.http.max_concurrent_requests == 0 {
            return invalid("HTTP max_concurrent_requests must be greater than 0".to_string());
        }
        if self.http.retries == 0 {
            return invalid("HTTP retries must be at least 1".to_string());
        }
        if self.http.retry_backoff == 0 {
            return invalid("HTTP retry backoff must be at least 1".to_string());
        }

        if self.storage.raw_dir == self.storage.processed_dir {
            return invalid(format!(
                "raw and processed directories must differ (both are '{}')",
                self.storage.raw_dir.display()
            ));
        }

        if self.database.max_connections == 0 {
            return invalid("Database max_connections must be greater than 0".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            return invalid(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            ));
        }
        if self.database.connect_retries == 0 {
            return invalid("Database connect_retries must be at least 1".to_string());
        }

        if self.pipeline.max_concurrent_transforms == 0 {
            return invalid("max_concurrent_transforms must be greater than 0".to_string());
        }

        Ok(())
    }
}
