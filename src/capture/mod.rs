//! Packet ingestion: one blocking reader per monitored interface.

pub mod pnet_source;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::accounting::AccountingWindow;
use crate::blocklist::BlockView;
use crate::error::CaptureError;
use crate::types::{CaptureEvent, TrafficRecord};

pub use pnet_source::PnetCapture;

/// A per-interface stream of packet observations.
pub trait CaptureSource: Send {
    fn interface(&self) -> &str;

    /// Next observed packet. `Ok(None)` means nothing arrived within the
    /// read timeout, so the caller can check for shutdown.
    fn next_event(&mut self) -> Result<Option<CaptureEvent>, CaptureError>;
}

#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    discarded: AtomicU64,
}

impl IngestStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Turns capture events into window records, skipping blocked sources.
#[derive(Clone)]
pub struct Ingestor {
    window: Arc<AccountingWindow>,
    blocks: BlockView,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(window: Arc<AccountingWindow>, blocks: BlockView) -> Self {
        Self {
            window,
            blocks,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Returns false when the event was discarded because its source is blocked.
    /// The append happens under the block table's entry lock, so once a block
    /// is inserted no further record for that source reaches the window.
    pub fn ingest(&self, event: CaptureEvent) -> bool {
        let window = &self.window;
        let accepted = self
            .blocks
            .if_unblocked(event.source, || window.append(TrafficRecord::from(event)));
        let counter = if accepted {
            &self.stats.accepted
        } else {
            &self.stats.discarded
        };
        counter.fetch_add(1, Ordering::Relaxed);
        accepted
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }
}

/// Blocking read loop for one source. Runs until cancelled or the source
/// fails; a failure is returned to the caller, which shuts the process down.
pub fn run_capture<S: CaptureSource>(
    mut source: S,
    ingestor: Ingestor,
    token: CancellationToken,
) -> Result<(), CaptureError> {
    let interface = source.interface().to_string();
    tracing::info!(interface = %interface, "📡 Capture started");

    while !token.is_cancelled() {
        match source.next_event() {
            Ok(Some(event)) => {
                ingestor.ingest(event);
            }
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(interface = %interface, "❌ Capture failed: {}", e);
                return Err(e);
            }
        }
    }

    tracing::info!(interface = %interface, "🛑 Capture stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::BlockManager;
    use crate::enforcement::DryRunEnforcer;
    use crate::types::SizeBand;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    struct Scripted {
        events: VecDeque<Result<Option<CaptureEvent>, CaptureError>>,
        token: CancellationToken,
    }

    impl CaptureSource for Scripted {
        fn interface(&self) -> &str {
            "test0"
        }

        fn next_event(&mut self) -> Result<Option<CaptureEvent>, CaptureError> {
            match self.events.pop_front() {
                Some(next) => next,
                None => {
                    self.token.cancel();
                    Ok(None)
                }
            }
        }
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn setup() -> (Arc<AccountingWindow>, BlockManager, Ingestor) {
        let window = Arc::new(AccountingWindow::new(
            Duration::from_secs(30),
            SizeBand::default(),
        ));
        let blocks = BlockManager::new(Box::new(DryRunEnforcer), Duration::from_secs(30));
        let ingestor = Ingestor::new(window.clone(), blocks.view());
        (window, blocks, ingestor)
    }

    #[tokio::test]
    async fn test_blocked_source_is_not_accounted() {
        let (window, blocks, ingestor) = setup();
        let now = Instant::now();

        assert!(ingestor.ingest(CaptureEvent::new(addr(1), 500, now)));
        blocks.request_block(addr(1), now, "volume").await;

        for _ in 0..10 {
            assert!(!ingestor.ingest(CaptureEvent::new(addr(1), 500, now)));
        }
        assert!(ingestor.ingest(CaptureEvent::new(addr(2), 500, now)));

        assert_eq!(window.len(), 2);
        assert_eq!(ingestor.stats().accepted(), 2);
        assert_eq!(ingestor.stats().discarded(), 10);
    }

    #[test]
    fn test_run_capture_drains_until_cancelled() {
        let (window, _blocks, ingestor) = setup();
        let token = CancellationToken::new();
        let now = Instant::now();

        let source = Scripted {
            events: VecDeque::from(vec![
                Ok(Some(CaptureEvent::new(addr(1), 64, now))),
                Ok(None),
                Ok(Some(CaptureEvent::new(addr(2), 64, now))),
            ]),
            token: token.clone(),
        };

        assert!(run_capture(source, ingestor, token).is_ok());
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_run_capture_returns_read_error() {
        let (window, _blocks, ingestor) = setup();
        let token = CancellationToken::new();

        let source = Scripted {
            events: VecDeque::from(vec![
                Ok(Some(CaptureEvent::new(addr(1), 64, Instant::now()))),
                Err(CaptureError::Read {
                    interface: "test0".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "link down"),
                }),
                Ok(Some(CaptureEvent::new(addr(2), 64, Instant::now()))),
            ]),
            token: token.clone(),
        };

        assert!(matches!(
            run_capture(source, ingestor, token.clone()),
            Err(CaptureError::Read { .. })
        ));
        assert_eq!(window.len(), 1);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_run_capture_exits_immediately_when_cancelled() {
        let (window, _blocks, ingestor) = setup();
        let token = CancellationToken::new();
        token.cancel();

        let source = Scripted {
            events: VecDeque::from(vec![Ok(Some(CaptureEvent::new(
                addr(1),
                64,
                Instant::now(),
            )))]),
            token: token.clone(),
        };

        assert!(run_capture(source, ingestor, token).is_ok());
        assert!(window.is_empty());
    }
}
