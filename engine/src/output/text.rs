//! Human-readable result lines

use std::io::{self, Write};

use crate::report::BenchmarkReport;

/// One line per channel, in configuration order
pub fn write_text<W: Write>(report: &BenchmarkReport, mut writer: W) -> io::Result<()> {
    for channel in &report.channels {
        writeln!(writer, "{}", channel)?;
    }
    writer.flush()
}
