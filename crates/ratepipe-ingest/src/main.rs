//! Ratepipe - daily exchange rate ingestion

use anyhow::{Context, Result};
use clap::Parser;
use ratepipe_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use ratepipe_ingest::config::DEFAULT_DAYS;
use ratepipe_ingest::{Config, DateRange, Pipeline, PipelineContext};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ratepipe")]
#[command(author, version, about = "Fetch daily exchange rates into raw JSON and Parquet partitions")]
struct Cli {
    /// Number of days to process, ending yesterday (UTC)
    #[arg(
        short,
        long,
        env = "RATEPIPE_DAYS",
        default_value_t = DEFAULT_DAYS,
        allow_negative_numbers = true
    )]
    days: i64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before clap reads RATEPIPE_DAYS
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the defaults below
    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Both)
        .log_file_prefix("ratepipe")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = Config::load().context("Failed to load configuration")?;
    let range = DateRange::ending_yesterday(cli.days, config.pipeline.date_order)?;

    info!(
        days = range.len(),
        start = %range.start(),
        end = %range.end(),
        "Processing {} day(s) ending {}",
        range.len(),
        range.end()
    );

    let ctx = PipelineContext::connect(config)
        .await
        .context("Failed to initialize pipeline")?;
    let pipeline = Pipeline::new(ctx);

    let summary = pipeline.run(&range).await;
    pipeline.shutdown().await;

    info!(
        uploaded = summary.uploaded(),
        already_uploaded = summary.already_uploaded(),
        converted = summary.converted(),
        failed = summary.failed(),
        "Ingestion complete"
    );
    Ok(())
}
