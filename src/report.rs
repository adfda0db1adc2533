//! The kernel's diagnostic text output.
//!
//! Tooling compares this text, so the line formats are fixed.

use crate::dma::TransferStats;
use crate::verify::Mismatch;

use prettytable::{self, format, row};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

pub const PASSED_MARKER: &str = "# verify: PASSED";
pub const FAILED_MARKER: &str = "# verify: FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLine {
    Time(u64),
    Mismatch { row: u32, col: u32, value: i64 },
    Verdict(bool),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized diagnostic line: {0:?}")]
pub struct ParseLineError(String);

impl DiagnosticLine {
    pub fn write_to<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "{self}")
    }
}

impl From<&Mismatch> for DiagnosticLine {
    fn from(mismatch: &Mismatch) -> Self {
        DiagnosticLine::Mismatch {
            row: mismatch.row,
            col: mismatch.col,
            value: mismatch.observed,
        }
    }
}

impl Display for DiagnosticLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLine::Time(cycles) => write!(f, "Time (cycles): {cycles}"),
            DiagnosticLine::Mismatch { row, col, value } => {
                write!(f, "NG [{row},{col}] = {value}")
            }
            DiagnosticLine::Verdict(true) => f.write_str(PASSED_MARKER),
            DiagnosticLine::Verdict(false) => f.write_str(FAILED_MARKER),
        }
    }
}

impl FromStr for DiagnosticLine {
    type Err = ParseLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseLineError(s.to_string());
        let line = s.trim_end();
        if line == PASSED_MARKER {
            return Ok(DiagnosticLine::Verdict(true));
        }
        if line == FAILED_MARKER {
            return Ok(DiagnosticLine::Verdict(false));
        }
        if let Some(cycles) = line.strip_prefix("Time (cycles): ") {
            return cycles.parse().map(DiagnosticLine::Time).map_err(|_| err());
        }
        let rest = line.strip_prefix("NG [").ok_or_else(err)?;
        let (cell, value) = rest.split_once("] = ").ok_or_else(err)?;
        let (row, col) = cell.split_once(',').ok_or_else(err)?;
        Ok(DiagnosticLine::Mismatch {
            row: row.parse().map_err(|_| err())?,
            col: col.parse().map_err(|_| err())?,
            value: value.parse().map_err(|_| err())?,
        })
    }
}

/// Parse every line of a transcript.
pub fn parse_transcript(text: &str) -> Result<Vec<DiagnosticLine>, ParseLineError> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// A table summarizing the transfers a run issued.
pub fn stats_table(stats: &TransferStats, cycles: u64) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["", "Transfers", "Words", "Ticks"]);
    table.add_row(row!["in", stats.reads, stats.words_in, ""]);
    table.add_row(row!["out", stats.writes, stats.words_out, ""]);
    table.add_row(row![
        "total",
        stats.reads + stats.writes,
        stats.words_in + stats.words_out,
        stats.ticks
    ]);
    table.add_row(row!["kernel", "", "", cycles]);

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_formats() {
        assert_eq!(DiagnosticLine::Time(1234).to_string(), "Time (cycles): 1234");
        assert_eq!(
            DiagnosticLine::Mismatch {
                row: 0,
                col: 0,
                value: 0
            }
            .to_string(),
            "NG [0,0] = 0"
        );
        assert_eq!(DiagnosticLine::Verdict(true).to_string(), "# verify: PASSED");
        assert_eq!(DiagnosticLine::Verdict(false).to_string(), "# verify: FAILED");
    }

    #[test]
    fn test_parse_transcript() {
        let text = "Time (cycles): 77\nNG [3,12] = -4\n# verify: FAILED\n";
        assert_eq!(
            parse_transcript(text).unwrap(),
            vec![
                DiagnosticLine::Time(77),
                DiagnosticLine::Mismatch {
                    row: 3,
                    col: 12,
                    value: -4
                },
                DiagnosticLine::Verdict(false),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_unknown_lines() {
        assert!("NG [1] = 3".parse::<DiagnosticLine>().is_err());
        assert!("verify: PASSED".parse::<DiagnosticLine>().is_err());
    }
}
