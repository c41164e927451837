use anyhow::{Context, Result};
use bench_core::aggregate_files;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "aggregator")]
#[command(about = "Merges benchmark series from several load generators into one")]
struct Args {
    /// Series files to merge
    inputs: Vec<PathBuf>,

    /// Also merge every .csv file in this directory
    #[arg(long)]
    from_dir: Option<PathBuf>,

    /// Merged series file
    #[arg(long, default_value = "output.csv")]
    out: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut inputs = args.inputs.clone();
    if let Some(dir) = &args.from_dir {
        inputs.extend(collect_series(dir, &args.out)?);
    }
    if inputs.is_empty() {
        anyhow::bail!("No input series given");
    }

    info!("Merging {} series into {}", inputs.len(), args.out.display());
    let rows = aggregate_files(&inputs, &args.out)?;
    info!("Wrote {} rows to {}", rows, args.out.display());

    Ok(())
}

/// `.csv` files directly inside `dir`, sorted by name. The output file is
/// skipped so a rerun does not merge its own previous result.
fn collect_series(dir: &Path, out: &Path) -> Result<Vec<PathBuf>> {
    let mut series = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {:?}", dir))?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some("csv") {
            continue;
        }
        if same_file(&path, out) {
            continue;
        }
        series.push(path);
    }

    series.sort();
    Ok(series)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_series_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.csv", "notes.txt", "output.csv"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let out = dir.path().join("output.csv");
        let series = collect_series(dir.path(), &out).unwrap();
        let names: Vec<_> = series
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
    }

    #[test]
    fn test_collect_series_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_series(&dir.path().join("absent"), Path::new("output.csv")).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["aggregator", "--out", "merged.csv", "a.csv", "b.csv"]).unwrap();
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.out, PathBuf::from("merged.csv"));
        assert!(args.from_dir.is_none());
    }
}
