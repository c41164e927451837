use crate::config::{base_url_string, TargetConfig};
use crate::meter::RateMeter;
use crate::periodic::{Periodic, PeriodicTask};
use crate::pool::WorkerPool;
use crate::sender::{build_client, CONTENT_TYPE_FHIR_JSON, PREFER_RETURN_MINIMAL};
use crate::series::{SeriesWriter, MILLIS_SINCE_START};
use crate::stats::per_second;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const UPLOAD_COLUMNS: [&str; 6] = [
    MILLIS_SINCE_START,
    "FilesPerSecond",
    "ResPerSecondOverall",
    "ResPerSecondMovingAvg",
    "Retries",
    "Failures",
];

/// Extra attempts per file after the first one fails.
pub const MAX_UPLOAD_RETRIES: u32 = 3;

// Shared reference data, loaded separately before the patient bundles.
const SKIPPED_PREFIXES: [&str; 2] = ["practitioner", "hospital"];

/// `.json` bundle files directly inside `dir`, in name order, without the
/// shared practitioner and hospital bundles. The first `start_index` files
/// are skipped so an interrupted upload can resume.
pub fn scan_bundles(dir: &Path, start_index: usize) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {:?}", dir))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        if SKIPPED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            continue;
        }
        files.push(path);
    }

    files.sort();
    Ok(files.into_iter().skip(start_index).collect())
}

/// Resources carried by a parsed file: the entries of a Bundle, or 1 for a
/// bare resource.
pub fn count_resources(resource: &Value) -> u64 {
    match resource.get("resourceType").and_then(Value::as_str) {
        Some("Bundle") => resource
            .get("entry")
            .and_then(Value::as_array)
            .map_or(0, |entries| entries.len() as u64),
        Some(_) => 1,
        None => 0,
    }
}

/// Upload progress shared between the workers and the reporter.
#[derive(Debug)]
pub struct UploadStats {
    started: Instant,
    files: AtomicU64,
    resources: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    resource_meter: RateMeter,
}

impl Default for UploadStats {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            files: AtomicU64::new(0),
            resources: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            resource_meter: RateMeter::new(),
        }
    }

    /// A file landed after `retries` failed attempts.
    pub fn record_uploaded(&self, resources: u64, retries: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.resources.fetch_add(resources, Ordering::Relaxed);
        self.retries.fetch_add(retries, Ordering::Relaxed);
        self.resource_meter.mark_n(resources);
    }

    /// A file was given up on.
    pub fn record_failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn resources(&self) -> u64 {
        self.resources.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn row(&self) -> UploadRow {
        self.row_at(self.elapsed())
    }

    /// Samples the counters as if `elapsed` had passed since the start.
    pub fn row_at(&self, elapsed: Duration) -> UploadRow {
        let millis = elapsed.as_millis() as u64;
        UploadRow {
            elapsed_millis: millis - millis % 1000,
            files_per_sec: per_second(self.files(), elapsed),
            resources_per_sec: per_second(self.resources(), elapsed),
            resources_moving_avg: self.resource_meter.mean_rate() as u64,
            retries: self.retries(),
            failures: self.failures(),
        }
    }
}

/// One row of the upload series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRow {
    pub elapsed_millis: u64,
    pub files_per_sec: u64,
    pub resources_per_sec: u64,
    pub resources_moving_avg: u64,
    pub retries: u64,
    pub failures: u64,
}

impl UploadRow {
    pub fn fields(&self) -> Vec<String> {
        [
            self.elapsed_millis,
            self.files_per_sec,
            self.resources_per_sec,
            self.resources_moving_avg,
            self.retries,
            self.failures,
        ]
        .iter()
        .map(u64::to_string)
        .collect()
    }
}

/// Posts bundle files to the server's base URL, retrying each one a few
/// times before giving up on it.
pub struct BundleUploader {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
    stats: Arc<UploadStats>,
}

impl BundleUploader {
    pub fn new(base_url: &url::Url, target: &TargetConfig, stats: Arc<UploadStats>) -> Result<Self> {
        Ok(Self {
            client: build_client(target, false)?,
            url: base_url_string(base_url),
            max_retries: MAX_UPLOAD_RETRIES,
            stats,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn stats(&self) -> &Arc<UploadStats> {
        &self.stats
    }

    /// Posts `body` until the server answers 200. Returns `false` once the
    /// retries are used up.
    pub async fn upload(&self, name: &str, body: Vec<u8>, resources: u64) -> bool {
        let mut errors = 0u32;
        loop {
            let response = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_FHIR_JSON)
                .header("Prefer", PREFER_RETURN_MINIMAL)
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => break,
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    warn!("Failure in file {}: HTTP {}: {}", name, status, text);
                }
                Err(e) => warn!("Failure in file {}: {}", name, e),
            }

            errors += 1;
            if errors > self.max_retries {
                self.stats.record_failed();
                return false;
            }
        }

        self.stats.record_uploaded(resources, u64::from(errors));
        true
    }

    /// Reads, counts and uploads one file. `index` and `total` only feed the
    /// progress log.
    pub async fn upload_file(&self, path: &Path, index: usize, total: usize) -> Result<bool> {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let resource: Value = serde_json::from_slice(&body)
            .with_context(|| format!("{} is not a JSON resource", path.display()))?;
        let resources = count_resources(&resource);
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let start = Instant::now();
        if !self.upload(&name, body, resources).await {
            return Ok(false);
        }

        let took_ms = (start.elapsed().as_millis() as u64).max(1);
        info!(
            "Uploaded file {}/{} in {}ms ({} res/sec), {} resources - {} files/sec(overall) - Retry[{}] Fail[{}]: {}",
            index,
            total,
            took_ms,
            resources * 1000 / took_ms,
            self.stats.resources(),
            per_second(self.stats.files(), self.stats.elapsed()),
            self.stats.retries(),
            self.stats.failures(),
            name
        );
        Ok(true)
    }

    /// Uploads `files` on `threads` workers and waits for every one of them.
    /// A file that cannot be read or parsed counts as a failure.
    pub async fn upload_all(self: Arc<Self>, files: Vec<PathBuf>, threads: usize) -> Result<()> {
        let total = files.len();
        info!("Uploading {} files with {} workers", total, threads);

        let pool = WorkerPool::new("upload", threads, threads);
        for (idx, path) in files.into_iter().enumerate() {
            let uploader = self.clone();
            pool.submit(async move {
                if let Err(e) = uploader.upload_file(&path, idx + 1, total).await {
                    warn!("Skipping file: {:#}", e);
                    uploader.stats.record_failed();
                }
            })
            .await?;
        }
        pool.shutdown().await
    }
}

/// Appends an upload series row every tick and once more on stop.
pub struct UploadReporter<W: Write> {
    stats: Arc<UploadStats>,
    writer: SeriesWriter<W>,
}

impl UploadReporter<BufWriter<File>> {
    /// Appends to the series file at `path`, keeping earlier runs.
    pub fn append(stats: Arc<UploadStats>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open upload series {}", path.display()))?;
        info!("Appending upload series to {}", path.display());
        Self::new(stats, BufWriter::new(file))
    }
}

impl<W: Write + Send + 'static> UploadReporter<W> {
    pub fn spawn(self, period: Duration, token: CancellationToken) -> PeriodicTask {
        PeriodicTask::spawn(self, Duration::ZERO, period, token)
    }
}

impl<W: Write> UploadReporter<W> {
    pub fn new(stats: Arc<UploadStats>, out: W) -> Result<Self> {
        let columns: Vec<String> = UPLOAD_COLUMNS.iter().map(|c| c.to_string()).collect();
        let writer = SeriesWriter::new(out, &columns)?;
        Ok(Self { stats, writer })
    }

    pub fn report(&mut self) -> Result<UploadRow> {
        let row = self.stats.row();
        self.writer
            .write_row(row.fields())
            .context("Failed to write upload row")?;
        Ok(row)
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner()
    }
}

impl<W: Write + Send + 'static> Periodic for UploadReporter<W> {
    fn name(&self) -> &'static str {
        "upload reporter"
    }

    fn tick(&mut self) -> Result<()> {
        self.report().map(|_| ())
    }

    fn finish(&mut self) -> Result<()> {
        let row = self.report()?;
        info!(
            "Upload finished: {} files, {} resources, {} retries, {} failures",
            self.stats.files(),
            self.stats.resources(),
            row.retries,
            row.failures
        );
        Ok(())
    }
}
