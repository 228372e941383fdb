//! Per-date extraction with hash-based dedup
//!
//! For each date: fetch the payload (bounded retries, exponential backoff),
//! check that it carries the rate series, hash its canonical form, compare
//! with the stored hash, and only on change write the raw file and then
//! upsert the hash. The raw file is always written before the metadata
//! commit, so a crash can never leave a metadata row pointing at a missing or
//! partial file. Whenever the raw file is rewritten the old Parquet file is
//! deleted first, so a processed file always matches the raw file it sits
//! beside, and a missing one is rebuilt by the next transform phase.

use chrono::NaiveDate;
use ratepipe_common::checksum::{verify_file_checksum, CanonicalJson};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::HttpConfig;
use crate::context::PipelineContext;
use crate::error::DateError;
use crate::paths::{remove_if_exists, write_atomic};
use crate::transform::parse_rows;

/// What extraction did for one date
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// New or changed content: raw file written and hash upserted
    Uploaded {
        hash: String,
        /// A different hash was stored before this run
        replaced: bool,
    },
    /// Stored hash matches upstream; nothing was upserted
    AlreadyUploaded {
        hash: String,
        /// The raw file was missing or did not match the hash, and has been written again
        restored_raw: bool,
    },
}

impl ExtractOutcome {
    pub fn hash(&self) -> &str {
        match self {
            ExtractOutcome::Uploaded { hash, .. } | ExtractOutcome::AlreadyUploaded { hash, .. } => {
                hash
            },
        }
    }

    /// Whether the raw file was (re)written in this run
    pub fn wrote_raw(&self) -> bool {
        match self {
            ExtractOutcome::Uploaded { .. } => true,
            ExtractOutcome::AlreadyUploaded { restored_raw, .. } => *restored_raw,
        }
    }
}

/// A failed attempt, before the retry decision
struct AttemptFailure {
    message: String,
    retry_after: Option<Duration>,
    rate_limited: bool,
}

impl From<reqwest::Error> for AttemptFailure {
    fn from(err: reqwest::Error) -> Self {
        Self {
            message: err.to_string(),
            retry_after: None,
            rate_limited: false,
        }
    }
}

/// Sleep before retrying after failed attempt number `attempt`
///
/// Exponential backoff, plus up to one backoff step of random jitter when the
/// server rate-limited us. A `Retry-After` longer than the backoff wins, but
/// nothing waits longer than [`HttpConfig::max_retry_delay`].
fn retry_delay(policy: &HttpConfig, attempt: u32, failure: &AttemptFailure) -> Duration {
    let backoff = policy.backoff_delay(attempt);
    let mut delay = backoff;
    if failure.rate_limited {
        let max_jitter = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        delay += Duration::from_millis(rand::rng().random_range(0..=max_jitter));
    }
    if let Some(retry_after) = failure.retry_after {
        delay = delay.max(retry_after);
    }
    delay.min(policy.max_retry_delay())
}

/// Whether the file at `path` exists and hashes to `hash`
async fn raw_file_matches(path: &Path, hash: &str) -> bool {
    let path = path.to_path_buf();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || verify_file_checksum(&path, &hash).is_ok())
        .await
        .unwrap_or(false)
}

/// Fetches one date at a time against the context's API, store and layout
pub struct Extractor<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> Extractor<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Run the full extract contract for `date`
    #[instrument(skip_all, fields(date = %date))]
    pub async fn extract(&self, date: NaiveDate) -> Result<ExtractOutcome, DateError> {
        let payload = self.fetch(date).await?;

        // Reject unusable shapes before anything is written
        let points = parse_rows(date, &payload, &self.ctx.config().api.series_key)?.len();
        debug!(date = %date, points, "Payload has expected shape");

        let canonical =
            CanonicalJson::from_value(&payload).map_err(|e| DateError::MalformedPayload {
                date,
                reason: format!("payload cannot be serialized: {}", e),
            })?;
        let (bytes, hash) = canonical.into_parts();

        let stored = self
            .ctx
            .store()
            .get_hash(date)
            .await
            .map_err(|e| DateError::Store {
                date,
                message: e.to_string(),
            })?;

        let raw_path = self.ctx.paths().raw_path(date);

        if stored.as_deref() == Some(hash.as_str()) {
            let raw_intact = raw_file_matches(&raw_path, &hash).await;
            if !raw_intact {
                warn!(
                    date = %date,
                    path = %raw_path.display(),
                    "Raw file missing or stale for unchanged content, writing it again"
                );
                write_atomic(&raw_path, &bytes)
                    .await
                    .map_err(|e| DateError::io(date, &raw_path, e))?;
                self.discard_processed(date).await?;
            }

            info!(date = %date, "data for date {} already uploaded", date);
            return Ok(ExtractOutcome::AlreadyUploaded {
                hash,
                restored_raw: !raw_intact,
            });
        }

        write_atomic(&raw_path, &bytes)
            .await
            .map_err(|e| DateError::io(date, &raw_path, e))?;
        self.discard_processed(date).await?;

        self.ctx
            .store()
            .upsert(date, &hash)
            .await
            .map_err(|e| DateError::Store {
                date,
                message: e.to_string(),
            })?;

        let replaced = stored.is_some();
        if replaced {
            warn!(date = %date, "data for date {} has changed upstream, replaced", date);
        }
        info!(
            date = %date,
            path = %raw_path.display(),
            hash = %hash,
            "data for date {} uploaded",
            date
        );

        Ok(ExtractOutcome::Uploaded { hash, replaced })
    }

    /// Remove the processed file of `date` after its raw file was rewritten
    ///
    /// The Parquet file then no longer exists for content it was not built
    /// from, and the transform phase (this run or a later one) rebuilds it.
    async fn discard_processed(&self, date: NaiveDate) -> Result<(), DateError> {
        let processed_path = self.ctx.paths().processed_path(date);
        if remove_if_exists(&processed_path)
            .await
            .map_err(|e| DateError::io(date, &processed_path, e))?
        {
            debug!(date = %date, path = %processed_path.display(), "Removed outdated processed file");
        }
        Ok(())
    }

    /// GET the payload for `date`, retrying transport failures and non-2xx responses
    async fn fetch(&self, date: NaiveDate) -> Result<Value, DateError> {
        let url = self.ctx.config().api.url_for(date);
        let policy = &self.ctx.config().http;
        let attempts = policy.retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetch_once(&url).await {
                Ok(body) => {
                    debug!(date = %date, attempt, bytes = body.len(), "Fetched payload");
                    return serde_json::from_slice(&body).map_err(|e| {
                        DateError::MalformedPayload {
                            date,
                            reason: format!("response is not valid JSON: {}", e),
                        }
                    });
                },
                Err(failure) => {
                    warn!(
                        date = %date,
                        url = %url,
                        attempt,
                        max_attempts = attempts,
                        error = %failure.message,
                        "Request failed"
                    );
                    last_error = failure.message.clone();

                    if attempt < attempts {
                        let delay = retry_delay(policy, attempt, &failure);
                        debug!(date = %date, delay_ms = delay.as_millis() as u64, "Retrying");
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }

        Err(DateError::Transport {
            date,
            attempts,
            message: last_error,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, AttemptFailure> {
        let response = self.ctx.http().get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptFailure {
                message: format!("HTTP error: {}", status),
                retry_after,
                rate_limited: status == StatusCode::TOO_MANY_REQUESTS,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
