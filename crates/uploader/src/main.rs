use anyhow::{Context, Result};
use bench_core::{
    parse_base_url, scan_bundles, BundleUploader, Tuning, UploadReporter, UploadStats,
    MAX_UPLOAD_RETRIES,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "uploader")]
#[command(about = "Bulk-loads FHIR bundle files into a server with a pool of workers")]
struct Args {
    /// Base URL the bundles are posted to
    base_url: String,

    /// Directory holding the .json bundle files
    source_dir: PathBuf,

    /// Number of concurrent uploads
    threads: usize,

    /// Files to skip, in name order, before uploading
    #[arg(default_value_t = 0)]
    start_index: usize,

    /// Optional TOML file with tuning overrides; only [target] is used
    #[arg(long)]
    config: Option<PathBuf>,

    /// Series file rows are appended to
    #[arg(long, default_value = "upload-synthea.csv")]
    output: PathBuf,

    /// Seconds between series rows
    #[arg(long, default_value_t = 60)]
    report_interval_secs: u64,

    /// Retries per file before it counts as failed
    #[arg(long, default_value_t = MAX_UPLOAD_RETRIES)]
    retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.threads == 0 {
        anyhow::bail!("thread count must be at least 1");
    }
    if args.report_interval_secs == 0 {
        anyhow::bail!("report interval must be non-zero");
    }

    let base_url = parse_base_url(&args.base_url)?;
    let tuning = match &args.config {
        Some(path) => Tuning::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Tuning::default(),
    };

    info!(
        "Starting {} worker uploader from directory {}",
        args.threads,
        args.source_dir.display()
    );
    let files = scan_bundles(&args.source_dir, args.start_index)?;
    info!("Have {} files", files.len());

    let stats = Arc::new(UploadStats::new());
    let uploader = BundleUploader::new(&base_url, &tuning.target, stats.clone())
        .context("Failed to create uploader")?
        .with_max_retries(args.retries);

    let token = CancellationToken::new();
    let reporter = UploadReporter::append(stats.clone(), &args.output)?.spawn(
        Duration::from_secs(args.report_interval_secs),
        token.clone(),
    );

    let uploaded = tokio::select! {
        result = Arc::new(uploader).upload_all(files, args.threads) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
            Ok(())
        }
        _ = token.cancelled() => Err(anyhow::anyhow!("Upload series could not be written")),
    };
    token.cancel();
    reporter.join().await.context("Upload reporter failed")?;
    uploaded?;

    println!("\n=== Upload Summary ===");
    println!("Files: {}", stats.files());
    println!("Resources: {}", stats.resources());
    println!("Retries: {}", stats.retries());
    println!("Failures: {}", stats.failures());
    println!();

    Ok(())
}
