use crate::operation::Operation;
use crate::periodic::{Periodic, PeriodicTask};
use crate::series::{self, SeriesRow, SeriesWriter};
use crate::session::BenchmarkSession;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Samples the session every tick, logs the sample and appends it to the
/// series file.
pub struct ProgressReporter<W: Write> {
    session: Arc<BenchmarkSession>,
    writer: SeriesWriter<W>,
    rows_written: u64,
}

impl ProgressReporter<BufWriter<File>> {
    /// Creates (or truncates) the series file at `path`.
    pub fn create(session: Arc<BenchmarkSession>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create series file {}", path.display()))?;
        info!("Writing progress series to {}", path.display());
        Self::new(session, BufWriter::new(file))
    }
}

impl<W: Write + Send + 'static> ProgressReporter<W> {
    /// Reports immediately, then once per configured interval.
    pub fn spawn(self) -> PeriodicTask {
        let period = self.session.config().metrics.report_interval();
        let token = self.session.shutdown_token();
        PeriodicTask::spawn(self, Duration::ZERO, period, token)
    }
}

impl<W: Write> ProgressReporter<W> {
    pub fn new(session: Arc<BenchmarkSession>, out: W) -> Result<Self> {
        let writer = SeriesWriter::new(out, &series::columns())?;
        Ok(Self {
            session,
            writer,
            rows_written: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Captures, logs and persists one row.
    pub fn report(&mut self) -> Result<SeriesRow> {
        let row = SeriesRow::capture(&self.session);
        let read = row.operation(Operation::Read);
        let search = row.operation(Operation::Search);
        let update = row.operation(Operation::Update);
        let create = row.operation(Operation::Create);

        info!(
            elapsed = %series::format_elapsed(row.elapsed_millis),
            read_per_sec = read.moving_avg_per_sec,
            search_per_sec = search.moving_avg_per_sec,
            update_per_sec = update.moving_avg_per_sec,
            create_per_sec = create.moving_avg_per_sec,
            failures = row.total_failures,
            concurrency = row.concurrency_per_operation,
            "{}",
            row.summary()
        );

        self.writer
            .write_row(row.fields())
            .context("Failed to write series row")?;
        self.rows_written += 1;
        Ok(row)
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner()
    }
}

impl<W: Write + Send + 'static> Periodic for ProgressReporter<W> {
    fn name(&self) -> &'static str {
        "progress reporter"
    }

    fn tick(&mut self) -> Result<()> {
        self.report().map(|_| ())
    }

    /// Writes a closing row so the series ends at shutdown time.
    fn finish(&mut self) -> Result<()> {
        self.report()?;
        info!("Progress series closed after {} rows", self.rows_written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Classification;
    use crate::series::SeriesReader;
    use crate::testing;
    use std::io;

    /// Fails any write that does not fit in the remaining budget.
    struct BrokenDisk {
        budget: usize,
    }

    impl Write for BrokenDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget < buf.len() {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            self.budget -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_report_appends_rows() {
        let session = Arc::new(BenchmarkSession::new(testing::config(3, 0)));
        let mut reporter = ProgressReporter::new(session.clone(), Vec::new()).unwrap();

        reporter.report().unwrap();
        session
            .stats(Operation::Update)
            .record(Classification::Conflict, 0);
        let row = reporter.report().unwrap();
        assert_eq!(row.operation(Operation::Update).total, 1);
        assert_eq!(reporter.rows_written(), 2);

        let bytes = reporter.into_inner().unwrap();
        let reader = SeriesReader::new("benchmark", bytes.as_slice()).unwrap();
        assert_eq!(reader.columns(), series::columns().as_slice());
        let rows: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("TotalUpdate"), Some("1"));
        assert_eq!(rows[1].get("ThreadCountPerOperation"), Some("3"));
        assert_eq!(rows[1].get("CachePct"), None);
    }

    #[test]
    fn test_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmark.csv");
        let session = Arc::new(BenchmarkSession::new(testing::config(1, 0)));

        let mut reporter = ProgressReporter::create(session, &path).unwrap();
        reporter.report().unwrap();

        // Each row is flushed as it is written, so the file is readable
        // while the reporter is still open.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# MillisSinceStart, TimeSinceStart, TotalRead"));
        assert_eq!(text.lines().count(), 3);

        reporter.report().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 4);
        assert_eq!(reporter.rows_written(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_aborts_run() {
        let session = Arc::new(BenchmarkSession::new(testing::config(1, 0)));
        // Room for the preamble but not for a row.
        let header = series::columns().join(", ").len() + 3;
        let disk = BrokenDisk {
            budget: header + 60,
        };
        let reporter = ProgressReporter::new(session.clone(), disk).unwrap();

        let err = reporter.spawn().join().await.unwrap_err();
        assert!(format!("{err:#}").contains("no space left"));
        assert!(session.is_shutting_down());
    }

    #[tokio::test]
    async fn test_final_row_on_shutdown() {
        let session = Arc::new(BenchmarkSession::new(testing::config(1, 0)));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.csv");
        let task = ProgressReporter::create(session.clone(), &path)
            .unwrap()
            .spawn();

        session.shutdown();
        task.join().await.unwrap();

        let rows = SeriesReader::new("series", File::open(&path).unwrap())
            .unwrap()
            .count();
        assert!(rows >= 1);
    }
}
