//! Block lifecycle: `unblocked -> blocked -> unblocked` per source address.
//!
//! The manager is owned by the evaluation task, which performs every
//! transition. Capture threads only get a `BlockView` to skip traffic from
//! blocked sources. Enforcement failures are logged and never retried; the
//! in-memory transition stands either way.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::MAX_SPAN_SECS;
use crate::enforcement::Enforcer;

/// Longest block the manager will create; keeps `now + duration` representable
const MAX_BLOCK_DURATION: Duration = Duration::from_secs(MAX_SPAN_SECS);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub source: IpAddr,
    pub blocked_until: Instant,
    pub reason: String,
}

impl BlockEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.blocked_until
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.blocked_until.saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Entry created and the firewall accepted the rule
    Blocked,
    /// Entry created but the firewall call failed
    Unenforced,
    /// Source already had an entry; nothing changed
    AlreadyBlocked,
}

/// Read-only snapshot of one entry for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockStatus {
    pub source: IpAddr,
    pub remaining_secs: u64,
    pub reason: String,
}

/// Cheap handle for capture threads.
#[derive(Clone)]
pub struct BlockView {
    table: Arc<DashMap<IpAddr, BlockEntry>>,
}

impl BlockView {
    /// Run `f` unless `source` is blocked. The table shard stays locked while
    /// `f` runs, so a block inserted concurrently lands either before the
    /// check (and `f` is skipped) or after `f` has finished.
    pub fn if_unblocked(&self, source: IpAddr, f: impl FnOnce()) -> bool {
        match self.table.entry(source) {
            Entry::Occupied(_) => false,
            Entry::Vacant(_vacant) => {
                f();
                true
            }
        }
    }
}

pub struct BlockManager {
    table: Arc<DashMap<IpAddr, BlockEntry>>,
    enforcer: Box<dyn Enforcer>,
    block_duration: Duration,
}

impl BlockManager {
    pub fn new(enforcer: Box<dyn Enforcer>, block_duration: Duration) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            enforcer,
            block_duration: block_duration.min(MAX_BLOCK_DURATION),
        }
    }

    pub fn view(&self) -> BlockView {
        BlockView {
            table: self.table.clone(),
        }
    }

    pub fn enforcer_name(&self) -> &'static str {
        self.enforcer.name()
    }

    pub fn is_blocked(&self, source: &IpAddr) -> bool {
        self.table.contains_key(source)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Block `source` until `now + block_duration`. An existing entry is left
    /// untouched (its expiry is never extended).
    pub async fn request_block(&self, source: IpAddr, now: Instant, reason: &str) -> BlockOutcome {
        if self.table.contains_key(&source) {
            return BlockOutcome::AlreadyBlocked;
        }

        let entry = BlockEntry {
            source,
            blocked_until: now + self.block_duration,
            reason: reason.to_string(),
        };
        self.table.insert(source, entry);

        match self.enforcer.add_block(source).await {
            Ok(()) => {
                tracing::warn!(
                    %source,
                    reason,
                    block_secs = self.block_duration.as_secs(),
                    "🚫 Blocked source"
                );
                BlockOutcome::Blocked
            }
            Err(e) => {
                tracing::error!(
                    %source,
                    reason,
                    enforcer = self.enforcer.name(),
                    "❌ Failed to block source, keeping it blocked in memory: {}",
                    e
                );
                BlockOutcome::Unenforced
            }
        }
    }

    /// Release every entry whose expiry has passed. Returns the released sources.
    pub async fn release_expired(&self, now: Instant) -> Vec<IpAddr> {
        // Copy out first; no map guard may live across the enforcement await
        let expired: Vec<IpAddr> = self
            .table
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.source)
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for source in expired {
            if self.release_entry(source, "block duration expired").await {
                released.push(source);
            }
        }
        released
    }

    /// Shutdown path: one firewall removal per active entry.
    pub async fn release_all(&self) -> usize {
        let sources: Vec<IpAddr> = self.table.iter().map(|entry| entry.source).collect();
        let mut released = 0;
        for source in sources {
            if self.release_entry(source, "shutting down").await {
                released += 1;
            }
        }
        released
    }

    /// Re-assert the firewall rule of every active entry. Entries are not
    /// modified. Returns the number of failed re-assertions.
    pub async fn reconcile(&self) -> usize {
        let sources: Vec<IpAddr> = self.table.iter().map(|entry| entry.source).collect();
        let mut failures = 0;
        for source in sources {
            if let Err(e) = self.enforcer.add_block(source).await {
                failures += 1;
                tracing::error!(%source, "❌ Failed to re-assert block: {}", e);
            }
        }
        failures
    }

    pub fn statuses(&self, now: Instant) -> Vec<BlockStatus> {
        let mut statuses: Vec<BlockStatus> = self
            .table
            .iter()
            .map(|entry| BlockStatus {
                source: entry.source,
                remaining_secs: entry.remaining(now).as_secs(),
                reason: entry.reason.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| {
            a.remaining_secs
                .cmp(&b.remaining_secs)
                .then_with(|| a.source.cmp(&b.source))
        });
        statuses
    }

    /// Remove `source`'s firewall rule and entry. A source with no entry is
    /// left alone and yields false.
    async fn release_entry(&self, source: IpAddr, why: &str) -> bool {
        if !self.table.contains_key(&source) {
            return false;
        }
        match self.enforcer.remove_block(source).await {
            Ok(()) => tracing::info!(%source, "✅ Unblocked source ({})", why),
            Err(e) => tracing::error!(
                %source,
                enforcer = self.enforcer.name(),
                "❌ Failed to remove block ({}), dropping entry anyway: {}",
                why,
                e
            ),
        }
        // Dropped regardless of the firewall result
        self.table.remove(&source);
        true
    }
}
