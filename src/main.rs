use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use reqwest::Url;

use apple_crash_report_uploader::{
    CrashReport, Formatter, Notifier, Transport, DEFAULT_ENDPOINT,
};

/// Parses an apple crash report and uploads it to a crash aggregation
/// service.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Project API key used to authenticate against the endpoint.
    api_key: String,

    /// Path to the crash report text file.
    report: PathBuf,

    /// Ingestion endpoint to deliver the event to.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: Url,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let text = fs::read_to_string(&args.report)
        .with_context(|| format!("failed to read {}", args.report.display()))?;
    let report: CrashReport = text.parse().context("failed to parse crash report")?;
    let payload = Formatter::new(Notifier::default())
        .format(&report)
        .context("failed to build event payload")?;
    Transport::new(args.endpoint, &args.api_key)
        .context("failed to set up http client")?
        .deliver(&payload)
        .context("failed to deliver crash report")?;

    println!("Crash report uploaded.");
    Ok(())
}
