//! JSON output
//!
//! Exports the benchmark report for further analysis

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

use crate::report::BenchmarkReport;

/// Write `report` as pretty-printed JSON to `output_path`
pub fn generate_json(report: &BenchmarkReport, output_path: &Path) -> Result<()> {
    info!("Generating JSON output: {}", output_path.display());

    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

    let writer = BufWriter::new(file);

    serde_json::to_writer_pretty(writer, report).context("Failed to serialize report to JSON")?;

    info!("JSON output written to {}", output_path.display());

    Ok(())
}
