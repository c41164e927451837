use anyhow::{Context, Result};
use bench_core::{
    build_client, format_elapsed, parse_base_url, BenchmarkConfig, BenchmarkSession, Config,
    CorpusLoader, HttpSender, IdCorpus, LoadedCorpus, MockSender, Operation, OperationRunner,
    OperationSender, ProgressReporter, RampScheduler, SeriesRow, Tuning,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "benchmarker")]
#[command(about = "FHIR load generator - drives read, search, update and create traffic")]
struct Args {
    /// Base URL all benchmark traffic is sent to
    gateway_base_url: String,

    /// Base URL the id corpus is loaded from
    read_node_base_url: String,

    /// Number of backend partitions
    partition_count: u32,

    /// Concurrency ceiling per operation
    max_concurrency: usize,

    /// Request compressed responses (true/false)
    #[arg(action = clap::ArgAction::Set)]
    compression: bool,

    /// Minutes to ramp concurrency up from 1; 0 starts at the ceiling
    ramp_up_minutes: u32,

    /// Optional TOML file with tuning overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Series file written once per second
    #[arg(long, default_value = "benchmark.csv")]
    output: PathBuf,

    /// Total number of patient ids to load
    #[arg(long, default_value_t = 1000)]
    corpus_size: usize,

    /// Submission mode
    #[arg(long, value_enum, default_value_t = Mode::Http)]
    mode: Mode,

    /// Seed for id selection
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Stop once this many requests have completed across all operations
    #[arg(long)]
    max_requests: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Http,
    Mock,
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

    let tuning = match &args.config {
        Some(path) => Tuning::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Tuning::default(),
    };
    let config = Config::new(
        BenchmarkConfig {
            gateway_base_url: args.gateway_base_url.clone(),
            read_node_base_url: args.read_node_base_url.clone(),
            partition_count: args.partition_count,
            max_concurrency: args.max_concurrency,
            compression: args.compression,
            ramp_up_minutes: args.ramp_up_minutes,
            corpus_size: args.corpus_size,
            seed: args.seed,
        },
        tuning,
    );
    config.validate().context("Invalid configuration")?;

    info!("Starting benchmark in {:?} mode", args.mode);
    info!("Gateway: {}", config.benchmark.gateway_base_url);
    info!("Read node: {}", config.benchmark.read_node_base_url);
    info!(
        "Partitions: {}, max concurrency: {}, compression: {}",
        config.benchmark.partition_count,
        config.benchmark.max_concurrency,
        config.benchmark.compression
    );

    let (patients, encounters, sender) = prepare(&config, args.mode).await?;
    info!("Using sender: {}", sender.name());

    let session = Arc::new(BenchmarkSession::new(config));
    match RampScheduler::new(session.clone()) {
        Some(_) => info!(
            "Benchmarker starting with 1 concurrent request per operation, ramping to {}",
            session.config().benchmark.max_concurrency
        ),
        None => info!(
            "Benchmarker starting with {} concurrent requests per operation",
            session.concurrency()
        ),
    }

    let reporter = ProgressReporter::create(session.clone(), &args.output)?.spawn();
    let ramp = RampScheduler::new(session.clone()).map(RampScheduler::spawn);

    let mut runners = Vec::new();
    for op in Operation::ALL {
        let ids = match op {
            Operation::Update => encounters.clone(),
            _ => patients.clone(),
        };
        if ids.is_empty() {
            warn!("No ids available for {}, not running it", op);
            continue;
        }
        let runner = OperationRunner::new(op, session.clone(), ids, sender.clone())?;
        runners.push(tokio::spawn(runner.run()));
    }

    wait_for_stop(&session, args.duration_secs, args.max_requests).await;
    session.shutdown();

    for runner in runners {
        runner.await??;
    }
    if let Some(ramp) = ramp {
        ramp.join().await?;
    }
    reporter.join().await.context("Progress reporter failed")?;

    info!("Series written to {}", args.output.display());
    print_summary(&SeriesRow::capture(&session));

    Ok(())
}

/// Loads the id corpus and builds the sender for `mode`.
async fn prepare(
    config: &Config,
    mode: Mode,
) -> Result<(Arc<IdCorpus>, Arc<IdCorpus>, Arc<dyn OperationSender>)> {
    let benchmark = &config.benchmark;
    match mode {
        Mode::Mock => {
            let corpus = LoadedCorpus::synthetic(benchmark.partition_count, benchmark.corpus_size);
            info!("Generated synthetic corpus of {} ids", corpus.patients.len());
            let sender: Arc<dyn OperationSender> = Arc::new(MockSender::new(config.mock.latency_ms));
            Ok((
                Arc::new(corpus.patients),
                Arc::new(corpus.encounters),
                sender,
            ))
        }
        Mode::Http => {
            let read_node = parse_base_url(&benchmark.read_node_base_url)?;
            let gateway = parse_base_url(&benchmark.gateway_base_url)?;

            let client = build_client(&config.target, benchmark.compression)
                .context("Failed to create HTTP client")?;
            let loader = CorpusLoader::new(client, &read_node, config.corpus.clone());
            let LoadedCorpus {
                patients,
                encounters,
                encounter_store,
            } = loader
                .load(benchmark.partition_count, benchmark.corpus_size)
                .await
                .context("Failed to load id corpus")?;

            let sender = HttpSender::new(
                &gateway,
                &config.target,
                benchmark.compression,
                Arc::new(encounter_store),
            )
            .context("Failed to create HTTP sender")?;
            let sender: Arc<dyn OperationSender> = Arc::new(sender);
            Ok((Arc::new(patients), Arc::new(encounters), sender))
        }
    }
}

/// Resolves once the run should end: Ctrl-C, the duration or request cap
/// being reached, or a fatal error cancelling the session.
async fn wait_for_stop(
    session: &BenchmarkSession,
    duration_secs: Option<u64>,
    max_requests: Option<u64>,
) {
    let token = session.shutdown_token();

    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let request_cap = async {
        let Some(max) = max_requests else {
            return std::future::pending().await;
        };
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        loop {
            poll.tick().await;
            if completed_requests(session) >= max {
                break;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
        _ = deadline => info!("Run duration elapsed, stopping"),
        _ = request_cap => info!("Request cap reached, stopping"),
        _ = token.cancelled() => warn!("Session cancelled, stopping"),
    }
}

fn completed_requests(session: &BenchmarkSession) -> u64 {
    session
        .operations()
        .iter()
        .map(|state| state.stats.counters.successes() + state.stats.counters.failures())
        .sum()
}

fn print_summary(row: &SeriesRow) {
    println!("\n=== Benchmark Summary ===");
    println!("Duration: {}", format_elapsed(row.elapsed_millis));
    for op in Operation::ALL {
        let s = row.operation(op);
        println!(
            "{}: total={} all-time={}/sec avg={}ms p75={}ms p95={}ms",
            op, s.total, s.all_time_per_sec, s.mean_ms, s.p75_ms, s.p95_ms
        );
    }
    println!("Failures: {}", row.total_failures);
    println!("Concurrency per operation: {}", row.concurrency_per_operation);
    if let Some(pct) = row.cache_hit_pct {
        println!("Cache hits: {}%", pct);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_args_parse() {
        let args = Args::try_parse_from([
            "benchmarker",
            "http://gateway:8000/fhir",
            "http://reader:8001/fhir",
            "4",
            "50",
            "true",
            "10",
            "--mode",
            "mock",
        ])
        .unwrap();
        assert_eq!(args.partition_count, 4);
        assert_eq!(args.max_concurrency, 50);
        assert!(args.compression);
        assert_eq!(args.ramp_up_minutes, 10);
        assert_eq!(args.mode, Mode::Mock);
        assert_eq!(args.output, PathBuf::from("benchmark.csv"));
        assert_eq!(args.corpus_size, 1000);
    }

    #[test]
    fn test_malformed_args_rejected() {
        let base = ["benchmarker", "http://g", "http://r", "4", "50"];
        assert!(Args::try_parse_from(base.iter().chain(&["yes", "10"])).is_err());
        assert!(Args::try_parse_from(base.iter().chain(&["false", "-1"])).is_err());
        assert!(Args::try_parse_from(base).is_err());
    }
}
