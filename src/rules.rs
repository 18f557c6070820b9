//! Rate-abuse rules evaluated against per-source aggregates.
//!
//! A rule is a pure predicate over one `SourceAggregate`; there is no state
//! carried between ticks. Rules are combined by a `RuleSet` according to the
//! deployment's `Combine` policy.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

use crate::types::SourceAggregate;

/// Volume share of the threshold at which a source is flagged as a warning
const WARNING_RATIO: f64 = 0.8;

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Short human-readable form, e.g. `bytes > 20000`
    fn describe(&self) -> String;

    fn matches(&self, aggregate: &SourceAggregate) -> bool;

    /// Close to firing. Only used for display.
    fn approaching(&self, _aggregate: &SourceAggregate) -> bool {
        false
    }
}

/// Fires when a source sent more than `byte_threshold` bytes in the window.
#[derive(Debug, Clone)]
pub struct VolumeRule {
    pub byte_threshold: u64,
}

impl Rule for VolumeRule {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn describe(&self) -> String {
        format!("bytes > {}", self.byte_threshold)
    }

    fn matches(&self, aggregate: &SourceAggregate) -> bool {
        aggregate.byte_total > self.byte_threshold
    }

    fn approaching(&self, aggregate: &SourceAggregate) -> bool {
        aggregate.byte_total as f64 > self.byte_threshold as f64 * WARNING_RATIO
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `count == limit`. A burst that jumps past the limit between two ticks
    /// never fires.
    #[default]
    Exact,
    /// `count >= limit`
    AtLeast,
}

impl Comparison {
    pub fn holds(&self, count: u64, limit: u64) -> bool {
        match self {
            Comparison::Exact => count == limit,
            Comparison::AtLeast => count >= limit,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Exact => "==",
            Comparison::AtLeast => ">=",
        }
    }
}

/// Fires on the number of packets inside the configured size band.
#[derive(Debug, Clone)]
pub struct PatternCountRule {
    pub limit: u64,
    pub comparison: Comparison,
}

impl Rule for PatternCountRule {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn describe(&self) -> String {
        format!("pattern {} {}", self.comparison.symbol(), self.limit)
    }

    fn matches(&self, aggregate: &SourceAggregate) -> bool {
        self.comparison.holds(aggregate.pattern_matches, self.limit)
    }

    fn approaching(&self, aggregate: &SourceAggregate) -> bool {
        self.limit > 0 && aggregate.pattern_matches == self.limit - 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    /// Any single rule firing is a violation
    #[default]
    Any,
    /// Every rule must fire
    All,
}

/// Rules that fired for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rules: Vec<&'static str>,
}

impl Violation {
    pub fn reason(&self) -> String {
        self.rules.join("+")
    }
}

pub struct RuleSet {
    combine: Combine,
    rules: Vec<Box<dyn Rule>>,
}

impl RuleSet {
    pub fn new(combine: Combine) -> Self {
        Self {
            combine,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn push(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// `None` when the aggregate does not violate the set. An empty set never fires.
    pub fn evaluate(&self, aggregate: &SourceAggregate) -> Option<Violation> {
        if self.rules.is_empty() {
            return None;
        }

        let fired: Vec<&'static str> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(aggregate))
            .map(|rule| rule.name())
            .collect();

        let violated = match self.combine {
            Combine::Any => !fired.is_empty(),
            Combine::All => fired.len() == self.rules.len(),
        };

        violated.then_some(Violation { rules: fired })
    }

    pub fn approaching(&self, aggregate: &SourceAggregate) -> bool {
        self.rules.iter().any(|rule| rule.approaching(aggregate))
    }

    pub fn describe(&self) -> String {
        let joiner = match self.combine {
            Combine::Any => " or ",
            Combine::All => " and ",
        };
        self.rules
            .iter()
            .map(|rule| rule.describe())
            .collect::<Vec<_>>()
            .join(joiner)
    }
}

/// Who may be blocked. Exempt sources never are; a non-empty watch list
/// restricts blocking to its members. Neither list affects accounting.
#[derive(Debug, Clone, Default)]
pub struct SourcePolicy {
    exempt: HashSet<IpAddr>,
    watched: HashSet<IpAddr>,
}

impl SourcePolicy {
    pub fn new(
        exempt: impl IntoIterator<Item = IpAddr>,
        watched: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            exempt: exempt.into_iter().collect(),
            watched: watched.into_iter().collect(),
        }
    }

    pub fn is_eligible(&self, source: &IpAddr) -> bool {
        if self.exempt.contains(source) {
            return false;
        }
        self.watched.is_empty() || self.watched.contains(source)
    }
}
