//! Rolling accounting window shared by the capture threads and the evaluator.
//!
//! Writers only ever push to the tail. The evaluator is the only reader and
//! the only one that evicts, always from the head, so time order is kept as
//! long as events arrive in near real time.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::types::{SizeBand, SourceAggregate, TrafficRecord};

pub struct AccountingWindow {
    records: Mutex<VecDeque<TrafficRecord>>,
    duration: Duration,
    band: SizeBand,
}

impl AccountingWindow {
    pub fn new(duration: Duration, band: SizeBand) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            duration,
            band,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn append(&self, record: TrafficRecord) {
        self.records.lock().push_back(record);
    }

    /// Drop every record older than `now - duration`. Returns the number evicted.
    pub fn prune(&self, now: Instant) -> usize {
        let mut records = self.records.lock();
        Self::prune_locked(&mut records, self.cutoff(now))
    }

    /// Prune, then fold the remaining records into per-source totals.
    pub fn snapshot_aggregates(&self, now: Instant) -> HashMap<IpAddr, SourceAggregate> {
        let cutoff = self.cutoff(now);
        let mut records = self.records.lock();
        let evicted = Self::prune_locked(&mut records, cutoff);
        if evicted > 0 {
            tracing::trace!(evicted, remaining = records.len(), "Pruned accounting window");
        }

        let mut aggregates: HashMap<IpAddr, SourceAggregate> = HashMap::new();
        for record in records.iter() {
            aggregates
                .entry(record.source)
                .or_default()
                .add(record.byte_size, self.band.contains(record.byte_size));
        }
        aggregates
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn cutoff(&self, now: Instant) -> Option<Instant> {
        // None while the monotonic clock is younger than the window
        now.checked_sub(self.duration)
    }

    fn prune_locked(records: &mut VecDeque<TrafficRecord>, cutoff: Option<Instant>) -> usize {
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut evicted = 0;
        while records
            .front()
            .is_some_and(|record| record.observed_at < cutoff)
        {
            records.pop_front();
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn record(source: IpAddr, byte_size: u32, observed_at: Instant) -> TrafficRecord {
        TrafficRecord {
            source,
            byte_size,
            observed_at,
        }
    }

    /// Shifted forward so `now - window` never underflows on a fresh boot.
    fn base() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn test_prune_evicts_only_stale_prefix() {
        let window = AccountingWindow::new(Duration::from_secs(30), SizeBand::default());
        let t0 = base();

        for offset in [0u64, 5, 10, 29, 40] {
            window.append(record(addr(1), 100, t0 + Duration::from_secs(offset)));
        }

        let now = t0 + Duration::from_secs(40);
        let evicted = window.prune(now);

        // cutoff = t0 + 10s; records at 0 and 5 are older
        assert_eq!(evicted, 2);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_prune_keeps_records_exactly_on_horizon() {
        let window = AccountingWindow::new(Duration::from_secs(30), SizeBand::default());
        let t0 = base();
        window.append(record(addr(1), 100, t0));

        assert_eq!(window.prune(t0 + Duration::from_secs(30)), 0);
        assert_eq!(window.len(), 1);
        assert_eq!(window.prune(t0 + Duration::from_millis(30_001)), 1);
        assert!(window.is_empty());
    }

    #[test]
    fn test_every_remaining_record_is_inside_horizon() {
        let duration = Duration::from_secs(10);
        let window = AccountingWindow::new(duration, SizeBand::default());
        let t0 = base();

        for i in 0..200u64 {
            window.append(record(addr((i % 7) as u8), 64, t0 + Duration::from_millis(i * 137)));
        }

        let now = t0 + Duration::from_secs(21);
        window.prune(now);

        let records = window.records.lock();
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.observed_at >= now - duration));
    }

    #[test]
    fn test_snapshot_folds_per_source() {
        let window = AccountingWindow::new(Duration::from_secs(30), SizeBand::new(110, 130));
        let t0 = base();

        window.append(record(addr(1), 120, t0));
        window.append(record(addr(1), 1500, t0 + Duration::from_secs(1)));
        window.append(record(addr(2), 115, t0 + Duration::from_secs(2)));
        window.append(record(addr(1), 129, t0 + Duration::from_secs(3)));

        let aggregates = window.snapshot_aggregates(t0 + Duration::from_secs(5));
        assert_eq!(aggregates.len(), 2);

        let a = aggregates[&addr(1)];
        assert_eq!(a.packet_count, 3);
        assert_eq!(a.byte_total, 1749);
        assert_eq!(a.pattern_matches, 2);

        let b = aggregates[&addr(2)];
        assert_eq!(b.packet_count, 1);
        assert_eq!(b.pattern_matches, 1);
    }

    #[test]
    fn test_snapshot_is_pure_without_appends() {
        let window = AccountingWindow::new(Duration::from_secs(30), SizeBand::default());
        let t0 = base();
        for i in 0..50u64 {
            window.append(record(addr((i % 3) as u8), 100 + i as u32, t0 + Duration::from_secs(i)));
        }

        let now = t0 + Duration::from_secs(60);
        let first = window.snapshot_aggregates(now);
        let second = window.snapshot_aggregates(now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_snapshot_prunes_before_folding() {
        let window = AccountingWindow::new(Duration::from_secs(30), SizeBand::default());
        let t0 = base();
        window.append(record(addr(1), 25_000, t0));

        let aggregates = window.snapshot_aggregates(t0 + Duration::from_secs(31));
        assert!(aggregates.is_empty());
        assert!(window.is_empty());
    }

    #[test]
    fn test_young_clock_prunes_nothing() {
        let window = AccountingWindow::new(Duration::from_secs(u64::MAX / 4), SizeBand::default());
        let now = Instant::now();
        window.append(record(addr(1), 64, now));
        assert_eq!(window.prune(now), 0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_concurrent_appends() {
        use std::sync::Arc;

        let window = Arc::new(AccountingWindow::new(
            Duration::from_secs(30),
            SizeBand::default(),
        ));
        let t0 = base();

        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let window = window.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        window.append(record(addr(n), 64, t0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let aggregates = window.snapshot_aggregates(t0);
        assert_eq!(window.len(), 4000);
        assert_eq!(aggregates.len(), 4);
        assert!(aggregates.values().all(|a| a.packet_count == 1000));
    }
}
