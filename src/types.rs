//! Shared value types for the accounting pipeline.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// A packet observation delivered by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureEvent {
    pub source: IpAddr,
    pub byte_size: u32,
    pub observed_at: Instant,
}

impl CaptureEvent {
    pub fn new(source: IpAddr, byte_size: u32, observed_at: Instant) -> Self {
        Self {
            source,
            byte_size,
            observed_at,
        }
    }
}

/// One accounted packet. Owned by the accounting window until it ages out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficRecord {
    pub source: IpAddr,
    pub byte_size: u32,
    pub observed_at: Instant,
}

impl From<CaptureEvent> for TrafficRecord {
    fn from(event: CaptureEvent) -> Self {
        Self {
            source: event.source,
            byte_size: event.byte_size,
            observed_at: event.observed_at,
        }
    }
}

/// Per-source totals folded from the current window. Rebuilt every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceAggregate {
    pub packet_count: u64,
    pub byte_total: u64,
    pub pattern_matches: u64,
}

impl SourceAggregate {
    pub fn add(&mut self, byte_size: u32, matches_band: bool) {
        self.packet_count += 1;
        self.byte_total += u64::from(byte_size);
        if matches_band {
            self.pattern_matches += 1;
        }
    }
}

/// Packet-size band with exclusive bounds, used to approximate a packet
/// type (e.g. connection setup) without payload inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeBand {
    pub above: u32,
    pub below: u32,
}

impl SizeBand {
    pub fn new(above: u32, below: u32) -> Self {
        Self { above, below }
    }

    pub fn contains(&self, byte_size: u32) -> bool {
        byte_size > self.above && byte_size < self.below
    }

    /// True when at least one size falls strictly inside the bounds.
    pub fn is_satisfiable(&self) -> bool {
        self.below > self.above.saturating_add(1)
    }
}

impl Default for SizeBand {
    fn default() -> Self {
        // Sync request size on the gateway the monitor was tuned for
        Self::new(110, 130)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_band_bounds_are_exclusive() {
        let band = SizeBand::default();
        assert!(!band.contains(110));
        assert!(band.contains(111));
        assert!(band.contains(129));
        assert!(!band.contains(130));
    }

    #[test]
    fn test_size_band_satisfiable() {
        assert!(SizeBand::new(110, 112).is_satisfiable());
        assert!(!SizeBand::new(110, 111).is_satisfiable());
        assert!(!SizeBand::new(130, 110).is_satisfiable());
        assert!(!SizeBand::new(u32::MAX, u32::MAX).is_satisfiable());
    }

    #[test]
    fn test_aggregate_add() {
        let mut agg = SourceAggregate::default();
        agg.add(120, true);
        agg.add(1500, false);
        assert_eq!(agg.packet_count, 2);
        assert_eq!(agg.byte_total, 1620);
        assert_eq!(agg.pattern_matches, 1);
    }
}
