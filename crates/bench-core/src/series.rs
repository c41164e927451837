use crate::operation::Operation;
use crate::session::BenchmarkSession;
use crate::stats::OperationSnapshot;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use std::io::{Read, Write};
use std::time::Duration;

pub const MILLIS_SINCE_START: &str = "MillisSinceStart";
pub const TIME_SINCE_START: &str = "TimeSinceStart";

const TRAILING_COLUMNS: [&str; 6] = [
    "TotalFailures",
    "MovingAvgFailuresPerSec",
    "MovingAvgRequestBytesPerSec",
    "MovingAvgResponseBytesPerSec",
    "ThreadCountPerOperation",
    "CachePct",
];

/// Column names of a benchmark series, in file order.
pub fn columns() -> Vec<String> {
    let mut columns = vec![MILLIS_SINCE_START.to_string(), TIME_SINCE_START.to_string()];
    for op in Operation::ALL {
        let label = op.label();
        columns.push(format!("Total{label}"));
        columns.push(format!("AllTime{label}PerSec"));
        columns.push(format!("MovingAvg{label}PerSec"));
        columns.push(format!("{label}AvgMsPerTx"));
        columns.push(format!("{label}75pctMsPerTx"));
        columns.push(format!("{label}95pctMsPerTx"));
    }
    columns.extend(TRAILING_COLUMNS.iter().map(|c| c.to_string()));
    columns
}

/// Renders elapsed milliseconds as `HH:MM:SS`, prefixed with `<days>d` past
/// the first day.
pub fn format_elapsed(millis: u64) -> String {
    let secs = millis / 1000;
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{days}d{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

/// Human-readable byte count, rounded down to the largest whole unit.
pub fn display_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b >= GB => format!("{} GB", b / GB),
        b if b >= MB => format!("{} MB", b / MB),
        b if b >= KB => format!("{} KB", b / KB),
        b => format!("{b} bytes"),
    }
}

/// One sample of the whole session, as logged and persisted each tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesRow {
    /// Run time, floored to whole seconds
    pub elapsed_millis: u64,
    /// Indexed by [`Operation::index`]
    pub operations: [OperationSnapshot; 4],
    pub total_failures: u64,
    pub failures_per_sec: u64,
    pub request_bytes_per_sec: u64,
    pub response_bytes_per_sec: u64,
    pub concurrency_per_operation: usize,
    pub cache_hit_pct: Option<u64>,
}

impl SeriesRow {
    pub fn capture(session: &BenchmarkSession) -> Self {
        Self::capture_at(session, session.elapsed())
    }

    pub fn capture_at(session: &BenchmarkSession, elapsed: Duration) -> Self {
        let operations = Operation::ALL.map(|op| session.stats(op).snapshot(elapsed));

        let mut total_failures = 0;
        let mut failures_per_min = 0.0;
        for state in session.operations() {
            total_failures += state.stats.counters.failures();
            failures_per_min += state.stats.failure_meter.one_minute_rate();
        }

        let millis = elapsed.as_millis() as u64;
        Self {
            elapsed_millis: millis - millis % 1000,
            operations,
            total_failures,
            failures_per_sec: (failures_per_min / 60.0) as u64,
            request_bytes_per_sec: session.request_bytes_meter().per_second() as u64,
            response_bytes_per_sec: session.response_bytes_meter().per_second() as u64,
            concurrency_per_operation: session.concurrency(),
            cache_hit_pct: session.cache_hit_pct(),
        }
    }

    pub fn operation(&self, op: Operation) -> &OperationSnapshot {
        &self.operations[op.index()]
    }

    /// Moving-average successes per second across all operations.
    pub fn success_per_sec(&self) -> u64 {
        self.operations.iter().map(|s| s.moving_avg_per_sec).sum()
    }

    /// Values in [`columns`] order.
    pub fn fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.elapsed_millis.to_string(),
            format_elapsed(self.elapsed_millis),
        ];
        for snapshot in &self.operations {
            fields.extend(
                [
                    snapshot.total,
                    snapshot.all_time_per_sec,
                    snapshot.moving_avg_per_sec,
                    snapshot.mean_ms,
                    snapshot.p75_ms,
                    snapshot.p95_ms,
                ]
                .iter()
                .map(u64::to_string),
            );
        }
        fields.push(self.total_failures.to_string());
        fields.push(self.failures_per_sec.to_string());
        fields.push(self.request_bytes_per_sec.to_string());
        fields.push(self.response_bytes_per_sec.to_string());
        fields.push(self.concurrency_per_operation.to_string());
        fields.push(
            self.cache_hit_pct
                .map(|pct| pct.to_string())
                .unwrap_or_default(),
        );
        fields
    }

    /// Multi-line progress block for the log.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for op in Operation::ALL {
            let s = self.operation(op);
            out.push_str(&format!(
                "\n{}[ Total {} - All {}/sec - MovAvg {}/sec - Avg {}ms/tx / 75pct {}ms/tx / 95pct {}ms/tx - {} Concurrent]",
                op,
                s.total,
                s.all_time_per_sec,
                s.moving_avg_per_sec,
                s.mean_ms,
                s.p75_ms,
                s.p95_ms,
                self.concurrency_per_operation
            ));
        }
        out.push_str(&format!(
            "\nSUCCESS[ MovAvg {}/sec] -- FAIL[ Total {} - MovAvg {}/sec - {} Concurrent]",
            self.success_per_sec(),
            self.total_failures,
            self.failures_per_sec,
            self.concurrency_per_operation * Operation::ALL.len()
        ));
        out.push_str(&format!(
            "\nREQ[ {} /sec] -- RESP[ {} /sec]",
            display_bytes(self.request_bytes_per_sec),
            display_bytes(self.response_bytes_per_sec)
        ));
        if let Some(pct) = self.cache_hit_pct {
            out.push_str(&format!("\nCACHE_HIT[ {pct}% ]"));
        }
        out
    }
}

/// Writes a series: an annotation line, a commented header, then rows.
pub struct SeriesWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl<W: Write> SeriesWriter<W> {
    /// Writes the preamble for `columns` and returns a writer ready for rows.
    pub fn new(mut out: W, columns: &[String]) -> Result<Self> {
        writeln!(out, "# Written: {}", chrono::Utc::now().to_rfc3339())?;
        writeln!(out, "# {}", columns.join(", "))?;
        let inner = csv::WriterBuilder::new()
            .flexible(true)
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(out);
        Ok(Self { inner })
    }

    /// Appends one row and flushes it to the underlying writer.
    pub fn write_row<I, T>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.inner.write_record(fields)?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.inner
            .into_inner()
            .map_err(|e| anyhow::anyhow!("failed to flush series: {}", e.error()))
    }
}

/// A data row of a series, keyed by column name.
///
/// Fields missing from a short row are absent; present fields keep their
/// raw (trimmed) text, which may be blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
    pub line: u64,
    pub values: IndexMap<String, String>,
}

impl SeriesRecord {
    /// Non-blank value of `column`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Forward-only reader over a persisted series.
///
/// Blank lines and single-field `#` lines are annotations and skipped. The
/// first multi-field line starting with `#` is the header.
pub struct SeriesReader<R: Read> {
    name: String,
    columns: Vec<String>,
    records: csv::StringRecordsIntoIter<R>,
}

impl<R: Read> SeriesReader<R> {
    pub fn new(name: impl Into<String>, input: R) -> Result<Self> {
        let name = name.into();
        let mut records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input)
            .into_records();

        let columns = loop {
            let record = match records.next() {
                Some(record) => record.with_context(|| format!("Failed to read {name}"))?,
                None => anyhow::bail!("{name} has no header line"),
            };
            let first = record.get(0).unwrap_or_default();
            if !first.starts_with('#') {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                anyhow::bail!("{name} line {line}: data before header line");
            }
            if record.len() > 1 {
                let mut columns: Vec<String> = record.iter().map(str::to_string).collect();
                columns[0] = first.trim_start_matches('#').trim().to_string();
                break columns;
            }
        };

        Ok(Self {
            name,
            columns,
            records,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl<R: Read> Iterator for SeriesReader<R> {
    type Item = Result<SeriesRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(e) => {
                    return Some(Err(
                        anyhow::Error::new(e).context(format!("Failed to read {}", self.name))
                    ))
                }
            };
            if record.len() == 1 && record.get(0).is_some_and(|f| f.starts_with('#') || f.is_empty()) {
                continue;
            }

            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let values = self
                .columns
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect();
            return Some(Ok(SeriesRecord { line, values }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Classification;
    use crate::sender::SendOutcome;
    use crate::testing;

    #[test]
    fn test_columns_layout() {
        let columns = columns();
        assert_eq!(columns.len(), 2 + 4 * 6 + 6);
        assert_eq!(columns[0], "MillisSinceStart");
        assert_eq!(columns[2], "TotalRead");
        assert_eq!(columns[7], "Read95pctMsPerTx");
        assert_eq!(columns[8], "TotalSearch");
        assert_eq!(columns[20], "TotalCreate");
        assert_eq!(columns.last().map(String::as_str), Some("CachePct"));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00:00");
        assert_eq!(format_elapsed(61_999), "00:01:01");
        assert_eq!(format_elapsed(3_600_000 * 25 + 5000), "1d01:00:05");
    }

    #[test]
    fn test_display_bytes() {
        assert_eq!(display_bytes(512), "512 bytes");
        assert_eq!(display_bytes(2048), "2 KB");
        assert_eq!(display_bytes(5 * 1024 * 1024 + 7), "5 MB");
    }

    #[test]
    fn test_capture_floors_elapsed_and_reads_stats() {
        let session = BenchmarkSession::new(testing::config(4, 0));
        for latency in [10, 20, 30] {
            session
                .stats(Operation::Read)
                .record(Classification::Success, latency);
        }
        session.stats(Operation::Create).record_failure();
        session.record_outcome(
            Operation::Read,
            &SendOutcome {
                status: 200,
                latency_ms: 4,
                request_bytes: 0,
                response_bytes: 10,
                cache_hit: Some(false),
            },
        );

        let row = SeriesRow::capture_at(&session, Duration::from_millis(3_750));
        assert_eq!(row.elapsed_millis, 3000);
        assert_eq!(row.operation(Operation::Read).total, 3);
        assert_eq!(row.operation(Operation::Read).all_time_per_sec, 0);
        assert_eq!(row.operation(Operation::Read).mean_ms, 20);
        assert_eq!(row.total_failures, 1);
        assert_eq!(row.concurrency_per_operation, 4);
        assert_eq!(row.cache_hit_pct, Some(0));

        let fields = row.fields();
        assert_eq!(fields.len(), columns().len());
        assert_eq!(fields[0], "3000");
        assert_eq!(fields[1], "00:00:03");
        assert_eq!(fields[2], "3");
        assert!(row.summary().contains("READ[ Total 3"));
    }

    #[test]
    fn test_cache_pct_blank_until_observed() {
        let session = BenchmarkSession::new(testing::config(1, 0));
        let row = SeriesRow::capture(&session);
        assert_eq!(row.fields().last().map(String::as_str), Some(""));
    }

    #[test]
    fn test_write_then_read_back() {
        let columns = vec!["X".to_string(), "Y".to_string()];
        let mut writer = SeriesWriter::new(Vec::new(), &columns).unwrap();
        writer.write_row(["1", "2"]).unwrap();
        writer.write_row(["3", ""]).unwrap();
        let bytes = writer.into_inner().unwrap();

        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("# Written: "));
        assert!(text.contains("\n# X, Y\n1,2\n"));

        let reader = SeriesReader::new("test", bytes.as_slice()).unwrap();
        assert_eq!(reader.columns(), ["X", "Y"]);
        let rows: Vec<SeriesRecord> = reader.map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Y"), Some("2"));
        assert_eq!(rows[1].get("Y"), None);
    }

    #[test]
    fn test_reader_tolerates_spacing_and_short_rows() {
        let input = "\n\n# Written: 2026-01-01T00:00:00Z\n# A, B, C\n1, 2, 3\n\n4 ,5\n# trailing note\n";
        let reader = SeriesReader::new("spaced", input.as_bytes()).unwrap();
        assert_eq!(reader.columns(), ["A", "B", "C"]);

        let rows: Vec<SeriesRecord> = reader.map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("B"), Some("2"));
        assert_eq!(rows[1].get("A"), Some("4"));
        assert_eq!(rows[1].get("C"), None);
        assert!(!rows[1].values.contains_key("C"));
    }

    #[test]
    fn test_reader_rejects_data_before_header() {
        assert!(SeriesReader::new("bad", "1,2\n# A, B\n".as_bytes()).is_err());
        assert!(SeriesReader::new("empty", "".as_bytes()).is_err());
    }
}
