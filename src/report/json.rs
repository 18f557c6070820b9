use std::io::{self, Write};

use super::{MonitorSnapshot, ReportSink};

/// Newline-delimited JSON, one snapshot per line.
pub struct JsonReport<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonReport<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ReportSink for JsonReport<W> {
    fn render(&mut self, snapshot: &MonitorSnapshot) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, snapshot)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::BlockStatus;
    use crate::report::{SourceRow, SourceStatus};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_one_document_per_line() {
        let source = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100));
        let snapshot = MonitorSnapshot::new(
            1_700_000_000,
            30,
            "pattern == 2".into(),
            vec![SourceRow {
                source,
                packets: 2,
                bytes: 240,
                pattern_matches: 2,
                status: SourceStatus::Blocked { remaining_secs: 30 },
            }],
            vec![BlockStatus {
                source,
                remaining_secs: 30,
                reason: "pattern".into(),
            }],
        );

        let mut report = JsonReport::new(Vec::new());
        report.render(&snapshot).unwrap();
        report.render(&snapshot).unwrap();
        let text = String::from_utf8(report.into_inner()).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["window_secs"], 30);
        assert_eq!(value["rows"][0]["source"], "10.0.0.100");
        assert_eq!(value["rows"][0]["status"]["state"], "blocked");
        assert_eq!(value["rows"][0]["status"]["remaining_secs"], 30);
        assert_eq!(value["blocked"][0]["reason"], "pattern");
        assert_eq!(value["totals"]["bytes"], 240);
    }
}
