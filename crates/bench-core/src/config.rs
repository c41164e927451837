use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for one benchmark run.
///
/// The run values come from the positional command line arguments; the
/// remaining sections are tuning knobs that default sensibly and can be
/// overridden through an optional TOML file (see [`Tuning`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub mock: MockConfig,
}

/// The optional tuning file: every section of [`Config`] except the run values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub target: TargetConfig,
    pub metrics: MetricsConfig,
    pub pool: PoolConfig,
    pub corpus: CorpusConfig,
    pub mock: MockConfig,
}

impl Tuning {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let tuning: Tuning = toml::from_str(&contents)?;
        Ok(tuning)
    }
}

impl Config {
    pub fn new(benchmark: BenchmarkConfig, tuning: Tuning) -> Self {
        Self {
            benchmark,
            target: tuning.target,
            metrics: tuning.metrics,
            pool: tuning.pool,
            corpus: tuning.corpus,
            mock: tuning.mock,
        }
    }

    /// Concurrency every operation starts with: 1 when ramping up, otherwise
    /// the ceiling.
    pub fn initial_concurrency(&self) -> usize {
        if self.benchmark.ramp_up_minutes > 0 {
            1
        } else {
            self.benchmark.max_concurrency
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let b = &self.benchmark;
        parse_base_url(&b.gateway_base_url).context("invalid gateway base URL")?;
        parse_base_url(&b.read_node_base_url).context("invalid read node base URL")?;
        if b.partition_count == 0 {
            anyhow::bail!("partition count must be at least 1");
        }
        if b.max_concurrency == 0 {
            anyhow::bail!("max concurrency must be at least 1");
        }
        if b.corpus_size < b.partition_count as usize {
            anyhow::bail!(
                "corpus size {} is smaller than the partition count {}",
                b.corpus_size,
                b.partition_count
            );
        }
        if self.metrics.report_interval_ms == 0 {
            anyhow::bail!("metrics.report_interval_ms must be non-zero");
        }
        if self.metrics.reservoir_size == 0 {
            anyhow::bail!("metrics.reservoir_size must be non-zero");
        }
        if self.pool.queue_capacity == 0 {
            anyhow::bail!("pool.queue_capacity must be non-zero");
        }
        if self.corpus.max_page_attempts == 0 {
            anyhow::bail!("corpus.max_page_attempts must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Base URL that all benchmark traffic is sent to
    pub gateway_base_url: String,
    /// Base URL the id corpus is paged from
    pub read_node_base_url: String,
    /// Number of backend partitions the corpus is spread across
    pub partition_count: u32,
    /// Concurrency ceiling per operation
    pub max_concurrency: usize,
    /// Ask the target for compressed responses
    #[serde(default)]
    pub compression: bool,
    /// Minutes to ramp from 1 to `max_concurrency`; 0 starts at the ceiling
    #[serde(default)]
    pub ramp_up_minutes: u32,
    /// Total number of patient ids to load across all partitions
    #[serde(default = "default_corpus_size")]
    pub corpus_size: usize,
    /// Seed for id selection; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_corpus_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub connect_timeout_ms: u64,
    /// Whole-request timeout; a request exceeding it counts as a failure
    pub request_timeout_ms: u64,
    pub max_idle_connections: usize,
}

impl TargetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 120_000,
            request_timeout_ms: 600_000,
            max_idle_connections: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub report_interval_ms: u64,
    /// Number of latency samples retained per operation
    pub reservoir_size: usize,
}

impl MetricsConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 1000,
            reservoir_size: 1028,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Submitted units of work that may wait for a free worker
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub page_size: u32,
    pub max_page_attempts: u32,
    /// Patients per partition whose encounters are fetched
    pub encounter_patients: usize,
    /// Patients per encounter search request
    pub encounter_batch: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_page_attempts: 5,
            encounter_patients: 100,
            encounter_batch: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Simulated service latency
    pub latency_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { latency_ms: 5 }
    }
}

/// Parses a base URL, accepting only http(s) URLs with a host.
pub fn parse_base_url(raw: &str) -> anyhow::Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("URL must be http:// or https:// (got scheme {other})"),
    }
    if url.host_str().is_none() {
        anyhow::bail!("URL must include a hostname (got {raw})");
    }
    Ok(url)
}

/// Renders a base URL without a trailing slash, ready for path joining.
pub fn base_url_string(url: &url::Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}
