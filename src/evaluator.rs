//! Single-task evaluation loop.
//!
//! Each tick releases expired blocks first, then aggregates the window and
//! blocks every eligible source that violates the rule set. Block requests
//! are collected before any firewall call so the window lock is only held
//! while folding.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::accounting::AccountingWindow;
use crate::blocklist::{BlockManager, BlockOutcome};
use crate::report::{MonitorSnapshot, ReportSink, SourceRow, SourceStatus};
use crate::rules::{RuleSet, SourcePolicy};

/// Result of one evaluation tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub released: Vec<IpAddr>,
    pub blocked: Vec<(IpAddr, BlockOutcome)>,
    pub snapshot: MonitorSnapshot,
}

pub struct Evaluator {
    window: Arc<AccountingWindow>,
    rules: RuleSet,
    policy: SourcePolicy,
    blocks: BlockManager,
}

impl Evaluator {
    pub fn new(
        window: Arc<AccountingWindow>,
        rules: RuleSet,
        policy: SourcePolicy,
        blocks: BlockManager,
    ) -> Self {
        Self {
            window,
            rules,
            policy,
            blocks,
        }
    }

    pub fn blocks(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn window(&self) -> &Arc<AccountingWindow> {
        &self.window
    }

    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        let released = self.blocks.release_expired(now).await;

        let aggregates = self.window.snapshot_aggregates(now);

        let mut violators: Vec<(IpAddr, String)> = aggregates
            .iter()
            .filter(|(source, _)| !self.blocks.is_blocked(source))
            .filter(|(source, _)| self.policy.is_eligible(source))
            .filter_map(|(source, aggregate)| {
                self.rules
                    .evaluate(aggregate)
                    .map(|violation| (*source, violation.reason()))
            })
            .collect();
        violators.sort();

        let mut blocked = Vec::with_capacity(violators.len());
        for (source, reason) in violators {
            if let Some(aggregate) = aggregates.get(&source) {
                tracing::debug!(
                    %source,
                    packets = aggregate.packet_count,
                    bytes = aggregate.byte_total,
                    pattern = aggregate.pattern_matches,
                    "Rule violation"
                );
            }
            let outcome = self.blocks.request_block(source, now, &reason).await;
            blocked.push((source, outcome));
        }

        let block_statuses = self.blocks.statuses(now);
        let remaining: HashMap<IpAddr, u64> = block_statuses
            .iter()
            .map(|status| (status.source, status.remaining_secs))
            .collect();

        let rows = aggregates
            .iter()
            .map(|(source, aggregate)| {
                let status = match remaining.get(source) {
                    Some(&remaining_secs) => SourceStatus::Blocked { remaining_secs },
                    None if self.rules.approaching(aggregate) => SourceStatus::Warning,
                    None => SourceStatus::Ok,
                };
                SourceRow {
                    source: *source,
                    packets: aggregate.packet_count,
                    bytes: aggregate.byte_total,
                    pattern_matches: aggregate.pattern_matches,
                    status,
                }
            })
            .collect();

        let snapshot = MonitorSnapshot::new(
            chrono::Utc::now().timestamp(),
            self.window.duration().as_secs(),
            self.rules.describe(),
            rows,
            block_statuses,
        );

        TickOutcome {
            released,
            blocked,
            snapshot,
        }
    }

    /// Drive `tick` on a fixed cadence until `token` is cancelled, then
    /// release every active block. Returns the number released at shutdown.
    pub async fn run(
        mut self,
        tick_interval: Duration,
        reconcile_interval: Option<Duration>,
        mut sink: Box<dyn ReportSink>,
        token: CancellationToken,
    ) -> usize {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_reconcile = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("🛑 Evaluation loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let outcome = self.tick(now).await;
                    if let Err(e) = sink.render(&outcome.snapshot) {
                        tracing::warn!("⚠️  Failed to render report: {}", e);
                    }

                    if let Some(every) = reconcile_interval {
                        if now.duration_since(last_reconcile) >= every {
                            last_reconcile = now;
                            if !self.blocks.is_empty() {
                                let failures = self.blocks.reconcile().await;
                                tracing::debug!(
                                    active = self.blocks.len(),
                                    failures,
                                    "Reconciled firewall rules"
                                );
                            }
                        }
                    }
                }
            }
        }

        let active = self.blocks.len();
        if active > 0 {
            tracing::info!(active, "🧹 Removing firewall rules before exit");
        }
        self.blocks.release_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::DryRunEnforcer;
    use crate::rules::{Combine, Comparison, PatternCountRule, VolumeRule};
    use crate::types::{SizeBand, TrafficRecord};
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn evaluator(policy: SourcePolicy) -> Evaluator {
        let window = Arc::new(AccountingWindow::new(
            Duration::from_secs(30),
            SizeBand::default(),
        ));
        let rules = RuleSet::new(Combine::Any)
            .with_rule(VolumeRule {
                byte_threshold: 20_000,
            })
            .with_rule(PatternCountRule {
                limit: 2,
                comparison: Comparison::Exact,
            });
        let blocks = BlockManager::new(Box::new(DryRunEnforcer), Duration::from_secs(30));
        Evaluator::new(window, rules, policy, blocks)
    }

    fn push(eval: &Evaluator, source: IpAddr, bytes: u32, at: Instant) {
        eval.window().append(TrafficRecord {
            source,
            byte_size: bytes,
            observed_at: at,
        });
    }

    #[tokio::test]
    async fn test_tick_blocks_and_reports_status() {
        let mut eval = evaluator(SourcePolicy::default());
        let t0 = Instant::now();
        push(&eval, addr(1), 21_000, t0);
        push(&eval, addr(2), 17_000, t0);
        push(&eval, addr(3), 100, t0);

        let outcome = eval.tick(t0 + Duration::from_secs(1)).await;
        assert_eq!(outcome.blocked, vec![(addr(1), BlockOutcome::Blocked)]);

        let status_of = |source: IpAddr| {
            outcome
                .snapshot
                .rows
                .iter()
                .find(|row| row.source == source)
                .map(|row| row.status)
        };
        assert_eq!(
            status_of(addr(1)),
            Some(SourceStatus::Blocked { remaining_secs: 30 })
        );
        assert_eq!(status_of(addr(2)), Some(SourceStatus::Warning));
        assert_eq!(status_of(addr(3)), Some(SourceStatus::Ok));
        assert_eq!(outcome.snapshot.blocked.len(), 1);
        assert_eq!(outcome.snapshot.blocked[0].reason, "volume");
    }

    #[tokio::test]
    async fn test_exempt_source_is_never_blocked() {
        let mut eval = evaluator(SourcePolicy::new([addr(1)], Vec::<IpAddr>::new()));
        let t0 = Instant::now();
        push(&eval, addr(1), 50_000, t0);

        let outcome = eval.tick(t0).await;
        assert!(outcome.blocked.is_empty());
        assert!(!eval.blocks().is_blocked(&addr(1)));
        assert_eq!(outcome.snapshot.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_list_limits_blocking() {
        let mut eval = evaluator(SourcePolicy::new(Vec::<IpAddr>::new(), [addr(100)]));
        let t0 = Instant::now();
        push(&eval, addr(100), 50_000, t0);
        push(&eval, addr(101), 50_000, t0);

        let outcome = eval.tick(t0).await;
        assert_eq!(outcome.blocked, vec![(addr(100), BlockOutcome::Blocked)]);
        assert!(!eval.blocks().is_blocked(&addr(101)));
    }

    #[tokio::test]
    async fn test_run_releases_blocks_on_cancel() {
        let eval = evaluator(SourcePolicy::default());
        push(&eval, addr(1), 50_000, Instant::now());
        push(&eval, addr(2), 50_000, Instant::now());

        let token = CancellationToken::new();
        let handle = tokio::spawn(eval.run(
            Duration::from_millis(10),
            Some(Duration::from_millis(20)),
            Box::new(crate::report::NullReport),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), 2);
    }
}
