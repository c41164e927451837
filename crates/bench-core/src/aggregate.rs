use crate::series::{SeriesReader, SeriesRecord, SeriesWriter, MILLIS_SINCE_START, TIME_SINCE_START};
use anyhow::{Context, Result};
use indexmap::IndexSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How the values of one column are combined across series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Value of the first series that has one
    First,
    Sum,
    /// Integer mean over the series that have a value
    Average,
}

pub fn reduction_for(column: &str) -> Reduction {
    if column == MILLIS_SINCE_START || column == TIME_SINCE_START {
        Reduction::First
    } else if column.ends_with("MsPerTx") || column.ends_with("Pct") {
        Reduction::Average
    } else {
        Reduction::Sum
    }
}

/// One output row: a value (possibly blank) for every column of the union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedRow {
    pub values: Vec<String>,
}

/// Merges several series row by row.
///
/// Rows are matched by ordinal only, and the merge stops as soon as any
/// input runs out.
pub struct Aggregator<R: Read> {
    readers: Vec<SeriesReader<R>>,
    columns: Vec<String>,
    done: bool,
}

impl<R: Read> Aggregator<R> {
    pub fn new(readers: Vec<SeriesReader<R>>) -> Result<Self> {
        if readers.is_empty() {
            anyhow::bail!("nothing to aggregate: no input series");
        }
        let mut columns = IndexSet::new();
        for reader in &readers {
            debug!("{} columns: {:?}", reader.name(), reader.columns());
            columns.extend(reader.columns().iter().cloned());
        }
        Ok(Self {
            readers,
            columns: columns.into_iter().collect(),
            done: false,
        })
    }

    /// Union of the input headers, in first-seen order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<AggregatedRow>> {
        let mut records = Vec::with_capacity(self.readers.len());
        for reader in &mut self.readers {
            match reader.next() {
                Some(record) => records.push(record?),
                None => {
                    debug!("{} exhausted", reader.name());
                    return Ok(None);
                }
            }
        }
        reduce(&self.columns, &records).map(Some)
    }
}

impl<R: Read> Iterator for Aggregator<R> {
    type Item = Result<AggregatedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let row = self.next_row().transpose();
        if !matches!(row, Some(Ok(_))) {
            self.done = true;
        }
        row
    }
}

/// Reduces the records at one ordinal into a row over `columns`.
pub fn reduce(columns: &[String], records: &[SeriesRecord]) -> Result<AggregatedRow> {
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let present = records.iter().filter_map(|r| r.get(column).map(|v| (r, v)));
        let value = match reduction_for(column) {
            Reduction::First => present
                .map(|(_, v)| v.to_string())
                .next()
                .unwrap_or_default(),
            reduction => {
                // Wide enough for any number of i64 contributors.
                let mut sum = 0i128;
                let mut contributors = 0i128;
                for (record, raw) in present {
                    let parsed: i64 = raw.parse().with_context(|| {
                        format!("line {}: {} is not an integer: {:?}", record.line, column, raw)
                    })?;
                    sum += i128::from(parsed);
                    contributors += 1;
                }
                match (reduction, contributors) {
                    (_, 0) => String::new(),
                    (Reduction::Average, n) => (sum / n).to_string(),
                    _ => sum.to_string(),
                }
            }
        };
        values.push(value);
    }
    Ok(AggregatedRow { values })
}

/// Aggregates the series files in `inputs` into `output` and returns the
/// number of rows written.
pub fn aggregate_files(inputs: &[PathBuf], output: &Path) -> Result<usize> {
    let mut readers = Vec::with_capacity(inputs.len());
    for input in inputs {
        let file = File::open(input)
            .with_context(|| format!("Failed to open {}", input.display()))?;
        let name = input.display().to_string();
        readers.push(SeriesReader::new(name, BufReader::new(file))?);
    }

    let aggregator = Aggregator::new(readers)?;
    info!(
        "Aggregating {} series over {} columns",
        inputs.len(),
        aggregator.columns().len()
    );

    let out = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer = SeriesWriter::new(BufWriter::new(out), aggregator.columns())?;

    let mut rows = 0;
    for row in aggregator {
        writer.write_row(row?.values)?;
        rows += 1;
    }
    writer.into_inner()?;
    Ok(rows)
}
