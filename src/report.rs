//! Rendering of the live report and of the final summary.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use crossterm::cursor::{MoveToColumn, MoveUp};
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};

use crate::stats::{ReportRow, RunSummary};

const HEADER: [&str; 4] = ["Operation", "Per Second", "Avg Speed (us)", "Errors"];

/// Receives what the stat aggregator wants to show.
pub trait ReportSink: Send {
    /// Replaces the current frame with a table of `rows`.
    fn render(&mut self, rows: &[ReportRow]) -> Result<()>;

    /// Keeps the current frame and draws subsequent tables below it.
    fn new_frame(&mut self) -> Result<()>;

    fn summary(&mut self, summary: &RunSummary) -> Result<()>;
}

/// Formats grouped errors as `message: count` pairs.
pub fn format_errors(errors: &BTreeMap<String, u64>) -> String {
    errors
        .iter()
        .map(|(error, count)| format!("{error}: {count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders a boxed table with a header row, ending with a newline.
pub fn render_table(rows: &[ReportRow]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(HEADER);
    for row in rows {
        table.add_row(vec![
            Cell::new(row.kind.label()),
            Cell::new(row.per_second),
            Cell::new(row.avg_latency_micros),
            Cell::new(format_errors(&row.errors)),
        ]);
    }
    format!("{table}\n")
}

fn format_latency(d: Duration) -> String {
    format!("{:.3}ms", d.as_secs_f64() * 1000.0)
}

/// Writes the summary of the run.
pub fn write_summary(summary: &RunSummary, out: &mut impl Write) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "Results:")?;
    writeln!(out, "Time:\t\t{:.3}s", summary.elapsed.as_secs_f64())?;
    for kind in &summary.kinds {
        writeln!(out, "{}:", kind.kind.label())?;
        writeln!(out, "  Total ops:\t{}", kind.op_count)?;
        writeln!(out, "  Operations/s:\t{:.1}", kind.ops_per_second)?;
        writeln!(out, "  mean:\t\t{}", format_latency(kind.mean))?;
        writeln!(out, "  median:\t{}", format_latency(kind.p50))?;
        writeln!(out, "  99th:\t\t{}", format_latency(kind.p99))?;
        writeln!(out, "  max:\t\t{}", format_latency(kind.max))?;
        if kind.error_count != 0 {
            writeln!(out, "  Total errors:\t{}", kind.error_count)?;
            for (error, count) in &kind.errors {
                writeln!(out, "    {count}\t{error}")?;
            }
        }
    }
    Ok(())
}

/// Draws the report in place on a terminal.
pub struct TerminalReport<W: Write + Send> {
    out: W,
    // Height of the table currently on screen, 0 if it must not be redrawn
    drawn_lines: u16,
}

impl<W: Write + Send> TerminalReport<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            drawn_lines: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ReportSink for TerminalReport<W> {
    fn render(&mut self, rows: &[ReportRow]) -> Result<()> {
        let table = render_table(rows);
        if self.drawn_lines > 0 {
            queue!(
                self.out,
                MoveUp(self.drawn_lines),
                MoveToColumn(0),
                Clear(ClearType::FromCursorDown),
            )?;
        }
        self.out.write_all(table.as_bytes())?;
        self.out.flush()?;
        self.drawn_lines = table.lines().count() as u16;
        Ok(())
    }

    fn new_frame(&mut self) -> Result<()> {
        writeln!(self.out)?;
        self.drawn_lines = 0;
        Ok(())
    }

    fn summary(&mut self, summary: &RunSummary) -> Result<()> {
        write_summary(summary, &mut self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::OpKind;
    use crate::stats::{group_errors, KindSummary};

    fn rows() -> Vec<ReportRow> {
        vec![
            ReportRow {
                kind: OpKind::Insert,
                per_second: 12345,
                avg_latency_micros: 402,
                errors: BTreeMap::new(),
            },
            ReportRow {
                kind: OpKind::Update,
                per_second: 7,
                avg_latency_micros: 90,
                errors: group_errors(["operation timed out"; 3]),
            },
        ]
    }

    #[test]
    fn test_render_table() {
        let table = render_table(&rows());
        let lines: Vec<&str> = table.lines().collect();

        // Header and both rows, each framed by borders
        assert_eq!(lines.len(), 7);
        assert!(table.ends_with('\n'));
        assert!(lines[0].starts_with('┌') && lines[0].ends_with('┐'));
        assert!(lines[6].starts_with('└') && lines[6].ends_with('┘'));
        for (line, cells) in [
            (lines[1], HEADER.to_vec()),
            (lines[3], vec!["Insert", "12345", "402"]),
            (lines[5], vec!["Updates", "7", "90", "operation timed out: 3"]),
        ] {
            let found: Vec<&str> = line
                .split(['│', '┆'])
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .collect();
            assert_eq!(found, cells);
        }

        // Columns line up
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|line| line.chars().count() == width));
    }

    #[test]
    fn test_terminal_report_redraws_in_place() {
        let height = render_table(&rows()).lines().count();
        let mut report = TerminalReport::new(Vec::new());
        report.render(&rows()).unwrap();
        report.render(&rows()).unwrap();
        report.new_frame().unwrap();
        report.render(&rows()).unwrap();
        let out = String::from_utf8(report.into_inner()).unwrap();

        // Only the second render moves the cursor back over the table
        assert_eq!(out.matches(&format!("\x1b[{height}A")).count(), 1);
        assert_eq!(out.matches("Operation").count(), 3);
    }

    #[test]
    fn test_write_summary() {
        let summary = RunSummary {
            elapsed: Duration::from_secs(2),
            kinds: vec![KindSummary {
                kind: OpKind::ReadByKey,
                op_count: 10,
                ops_per_second: 5.0,
                error_count: 2,
                errors: group_errors(["timeout", "timeout"]),
                mean: Duration::from_micros(1500),
                p50: Duration::from_micros(1000),
                p99: Duration::from_micros(4000),
                max: Duration::from_micros(4100),
            }],
        };
        let mut out = Vec::new();
        write_summary(&summary, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Reads by _id:"));
        assert!(out.contains("Total ops:\t10"));
        assert!(out.contains("mean:\t\t1.500ms"));
        assert!(out.contains("Total errors:\t2"));
        assert!(out.contains("2\ttimeout"));
    }
}
