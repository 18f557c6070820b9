//! Read-only snapshots of the monitor state and the sinks that render them.

pub mod json;
pub mod table;

use serde::{Deserialize, Serialize};
use std::io;
use std::net::IpAddr;

use crate::blocklist::BlockStatus;

pub use json::JsonReport;
pub use table::TableReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Warning,
    Blocked { remaining_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRow {
    pub source: IpAddr,
    pub packets: u64,
    pub bytes: u64,
    pub pattern_matches: u64,
    pub status: SourceStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub packets: u64,
    pub bytes: u64,
    pub pattern_matches: u64,
}

/// Everything a sink needs for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    /// Unix seconds
    pub generated_at: i64,
    pub window_secs: u64,
    pub rule_summary: String,
    pub rows: Vec<SourceRow>,
    pub blocked: Vec<BlockStatus>,
    pub totals: Totals,
}

impl MonitorSnapshot {
    /// Sorts rows by packet count (descending, then address) and fills in totals.
    pub fn new(
        generated_at: i64,
        window_secs: u64,
        rule_summary: String,
        mut rows: Vec<SourceRow>,
        blocked: Vec<BlockStatus>,
    ) -> Self {
        rows.sort_by(|a, b| b.packets.cmp(&a.packets).then_with(|| a.source.cmp(&b.source)));
        let totals = rows.iter().fold(Totals::default(), |mut acc, row| {
            acc.packets += row.packets;
            acc.bytes += row.bytes;
            acc.pattern_matches += row.pattern_matches;
            acc
        });
        Self {
            generated_at,
            window_secs,
            rule_summary,
            rows,
            blocked,
            totals,
        }
    }
}

pub trait ReportSink: Send {
    fn render(&mut self, snapshot: &MonitorSnapshot) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Full-screen table redrawn every tick
    #[default]
    Table,
    /// One JSON document per line on stdout
    Json,
    /// Summary line through the log
    Log,
    Off,
}

impl std::str::FromStr for ReportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(ReportMode::Table),
            "json" => Ok(ReportMode::Json),
            "log" => Ok(ReportMode::Log),
            "off" | "none" => Ok(ReportMode::Off),
            other => Err(format!(
                "unknown report mode '{}' (must be table/json/log/off)",
                other
            )),
        }
    }
}

/// Emits a one-line summary per tick; suited to journald.
#[derive(Debug, Default)]
pub struct LogReport;

impl ReportSink for LogReport {
    fn render(&mut self, snapshot: &MonitorSnapshot) -> io::Result<()> {
        tracing::info!(
            sources = snapshot.rows.len(),
            packets = snapshot.totals.packets,
            bytes = snapshot.totals.bytes,
            pattern = snapshot.totals.pattern_matches,
            blocked = snapshot.blocked.len(),
            "📊 Window summary"
        );
        for row in &snapshot.rows {
            if row.status == SourceStatus::Warning {
                tracing::warn!(
                    source = %row.source,
                    bytes = row.bytes,
                    pattern = row.pattern_matches,
                    "⚠️  Source approaching limits"
                );
            }
        }
        Ok(())
    }
}

/// Discards every snapshot.
#[derive(Debug, Default)]
pub struct NullReport;

impl ReportSink for NullReport {
    fn render(&mut self, _snapshot: &MonitorSnapshot) -> io::Result<()> {
        Ok(())
    }
}

/// Build the sink for a mode; table and JSON output go to stdout.
pub fn sink_for(mode: ReportMode) -> Box<dyn ReportSink> {
    match mode {
        ReportMode::Table => Box::new(TableReport::stdout()),
        ReportMode::Json => Box::new(JsonReport::new(io::stdout())),
        ReportMode::Log => Box::new(LogReport),
        ReportMode::Off => Box::new(NullReport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn row(last: u8, packets: u64, bytes: u64, status: SourceStatus) -> SourceRow {
        SourceRow {
            source: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            packets,
            bytes,
            pattern_matches: packets / 2,
            status,
        }
    }

    #[test]
    fn test_snapshot_sorts_and_totals() {
        let snapshot = MonitorSnapshot::new(
            0,
            30,
            "bytes > 20000".to_string(),
            vec![
                row(3, 5, 500, SourceStatus::Ok),
                row(1, 10, 1000, SourceStatus::Ok),
                row(2, 10, 900, SourceStatus::Warning),
            ],
            vec![],
        );

        let order: Vec<u8> = snapshot
            .rows
            .iter()
            .map(|r| match r.source {
                IpAddr::V4(v4) => v4.octets()[3],
                IpAddr::V6(_) => 0,
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(snapshot.totals.packets, 25);
        assert_eq!(snapshot.totals.bytes, 2400);
        assert_eq!(snapshot.totals.pattern_matches, 12);
    }

    #[test]
    fn test_report_mode_parse() {
        assert_eq!("TABLE".parse::<ReportMode>(), Ok(ReportMode::Table));
        assert_eq!("none".parse::<ReportMode>(), Ok(ReportMode::Off));
        assert!("curses".parse::<ReportMode>().is_err());
    }

    #[test]
    fn test_log_report_renders() {
        let snapshot = MonitorSnapshot::new(
            0,
            30,
            String::new(),
            vec![row(1, 1, 100, SourceStatus::Warning)],
            vec![],
        );
        assert!(LogReport.render(&snapshot).is_ok());
    }
}
