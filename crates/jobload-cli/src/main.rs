use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use jobload_pipeline::{
    store_config_from_env, JobLoader, LoaderConfig, RunOptions, TerminalGate, DEFAULT_INPUT_FILE,
};
use jobload_store::{MongoJobWriter, RecordSink};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobload", version)]
#[command(about = "Normalize a scraped LinkedIn job and push it to the jobs collection")]
struct Cli {
    /// Location written into the record's `location` field.
    #[arg(long)]
    location: Option<String>,
    #[arg(long, default_value = DEFAULT_INPUT_FILE)]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = Utc::now();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = LoaderConfig::from_env().context("loading operator configuration")?;
    info!(user_id = %config.operator.user_id, location = ?cli.location, "starting job load");

    let loader = JobLoader::new(config);
    let options = RunOptions {
        input: cli.input,
        location: cli.location,
        started_at,
    };

    let mut stdout = std::io::stdout();
    let summary = loader
        .run_once(&options, &mut stdout, &TerminalGate, || {
            let store = store_config_from_env().context("loading store configuration")?;
            Ok(Arc::new(MongoJobWriter::new(store)) as Arc<dyn RecordSink>)
        })
        .await?;

    println!(
        "load complete: record_id={} pushed={} inserted={}",
        summary.record.id,
        summary.pushed,
        summary.inserted_ids.len()
    );

    Ok(())
}
