//! Gateway traffic monitor.
//!
//! Capture threads append per-packet records to a shared sliding window; a
//! single evaluation task aggregates the window every tick, applies the rule
//! set and drives the block lifecycle through a firewall enforcer.

pub mod accounting;
pub mod blocklist;
pub mod capture;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod evaluator;
pub mod report;
pub mod rules;
pub mod shutdown;
pub mod types;

pub use accounting::AccountingWindow;
pub use blocklist::{BlockManager, BlockOutcome, BlockView};
pub use capture::{CaptureSource, Ingestor};
pub use config::Config;
pub use enforcement::Enforcer;
pub use error::{AppError, CaptureError, ConfigError, EnforcementError};
pub use evaluator::{Evaluator, TickOutcome};
pub use rules::{Rule, RuleSet, SourcePolicy};
