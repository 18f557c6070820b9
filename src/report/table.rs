//! Terminal table, redrawn in place every tick.

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use std::io::{self, IsTerminal, Stdout, Write};

use super::{MonitorSnapshot, ReportSink, SourceStatus};

const WIDTH: usize = 95;

pub struct TableReport<W: Write + Send> {
    out: W,
    clear_screen: bool,
}

impl TableReport<Stdout> {
    /// Stdout, clearing the screen between frames only when it is a terminal.
    pub fn stdout() -> Self {
        let out = io::stdout();
        let clear_screen = out.is_terminal();
        Self { out, clear_screen }
    }
}

impl<W: Write + Send> TableReport<W> {
    pub fn new(out: W, clear_screen: bool) -> Self {
        Self { out, clear_screen }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_frame(&mut self, snapshot: &MonitorSnapshot) -> io::Result<()> {
        let heavy = "=".repeat(WIDTH);
        let light = "-".repeat(WIDTH);
        let out = &mut self.out;

        if self.clear_screen {
            queue!(out, Clear(ClearType::All), Clear(ClearType::Purge), MoveTo(0, 0))?;
        }

        writeln!(out, "{}", heavy)?;
        writeln!(
            out,
            "  Gatewarden ({} per {}s window)",
            snapshot.rule_summary, snapshot.window_secs
        )?;
        writeln!(out, "{}", heavy)?;
        writeln!(
            out,
            "{:<20} {:<12} {:<15} {:<12} {:<12} {:<15}",
            "Source IP", "Packets", "Bytes", "Pattern", "Formatted", "Status"
        )?;
        writeln!(out, "{}", light)?;

        if snapshot.rows.is_empty() {
            writeln!(
                out,
                "  No traffic detected in the last {} seconds...",
                snapshot.window_secs
            )?;
        } else {
            for row in &snapshot.rows {
                writeln!(
                    out,
                    "{:<20} {:<12} {:<15} {:<12} {:<12} {:<15}",
                    row.source.to_string(),
                    row.packets,
                    row.bytes,
                    row.pattern_matches,
                    format_bytes(row.bytes),
                    status_label(&row.status)
                )?;
            }
            writeln!(out, "{}", light)?;
            writeln!(
                out,
                "{:<20} {:<12} {:<15} {:<12} {:<12}",
                "TOTAL",
                snapshot.totals.packets,
                snapshot.totals.bytes,
                snapshot.totals.pattern_matches,
                format_bytes(snapshot.totals.bytes)
            )?;
        }

        if !snapshot.blocked.is_empty() {
            writeln!(out, "{}", heavy)?;
            writeln!(out, "  BLOCKED SOURCES:")?;
            writeln!(out, "{}", light)?;
            for blocked in &snapshot.blocked {
                writeln!(
                    out,
                    "  🔒 {:<20} - Unblocks in {}s ({})",
                    blocked.source.to_string(),
                    blocked.remaining_secs,
                    blocked.reason
                )?;
            }
        }

        writeln!(out, "{}", heavy)?;
        writeln!(out, "Press Ctrl+C to stop")?;
        out.flush()
    }
}

impl<W: Write + Send> ReportSink for TableReport<W> {
    fn render(&mut self, snapshot: &MonitorSnapshot) -> io::Result<()> {
        self.write_frame(snapshot)
    }
}

fn status_label(status: &SourceStatus) -> String {
    match status {
        SourceStatus::Ok => "[+] OK".to_string(),
        SourceStatus::Warning => "[!] WARNING".to_string(),
        SourceStatus::Blocked { remaining_secs } => format!("[-] BLOCKED ({}s)", remaining_secs),
    }
}

/// Human-readable byte count with two decimals (B, KB, MB, GB, TB).
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} TB", value)
}
