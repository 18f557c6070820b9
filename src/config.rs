//! Configuration for the gatewarden daemon.
//!
//! Loaded from a TOML file. Every section and field has a default, so a file
//! only needs the values that differ (usually `monitor.interfaces` and the
//! rule thresholds). `validate` runs once at startup; any error there keeps
//! the daemon from starting.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::report::ReportMode;
use crate::rules::{Combine, Comparison, PatternCountRule, RuleSet, SourcePolicy, VolumeRule};
use crate::types::SizeBand;

/// Longest accepted window, block or reconcile span (one year)
pub const MAX_SPAN_SECS: u64 = 365 * 24 * 60 * 60;

/// Longest accepted tick interval (one hour)
pub const MAX_TICK_INTERVAL_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Trailing span aggregated per source
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
    /// Re-assert active firewall rules this often (0 disables)
    #[serde(default)]
    pub reconcile_interval_secs: u64,
    /// Only account TCP packets
    #[serde(default)]
    pub tcp_only: bool,
}

fn default_interfaces() -> Vec<String> {
    vec!["eth1".to_string(), "eth2".to_string()]
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_window_secs() -> u64 {
    30
}

fn default_block_secs() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
            tick_interval_ms: default_tick_interval_ms(),
            window_secs: default_window_secs(),
            block_secs: default_block_secs(),
            reconcile_interval_secs: 0,
            tcp_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub combine: Combine,
    #[serde(default)]
    pub volume: VolumeRuleConfig,
    #[serde(default)]
    pub pattern: PatternRuleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_byte_threshold")]
    pub byte_threshold: u64,
}

fn default_true() -> bool {
    true
}

fn default_byte_threshold() -> u64 {
    20_000
}

impl Default for VolumeRuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            byte_threshold: default_byte_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pattern_limit")]
    pub limit: u64,
    #[serde(default)]
    pub comparison: Comparison,
    /// Packet sizes counted as pattern matches (exclusive bounds)
    #[serde(default)]
    pub band: SizeBand,
}

fn default_pattern_limit() -> u64 {
    2
}

impl Default for PatternRuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_pattern_limit(),
            comparison: Comparison::default(),
            band: SizeBand::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Never blocked, still accounted
    #[serde(default)]
    pub exempt: Vec<IpAddr>,
    /// When non-empty, only these sources can be blocked
    #[serde(default)]
    pub watched: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementBackend {
    #[default]
    Iptables,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub backend: EnforcementBackend,
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
    #[serde(default = "default_ip6tables_path")]
    pub ip6tables_path: String,
    #[serde(default = "default_chain")]
    pub chain: String,
}

fn default_iptables_path() -> String {
    "iptables".to_string()
}

fn default_ip6tables_path() -> String {
    "ip6tables".to_string()
}

fn default_chain() -> String {
    "FORWARD".to_string()
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            backend: EnforcementBackend::default(),
            iptables_path: default_iptables_path(),
            ip6tables_path: default_ip6tables_path(),
            chain: default_chain(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub mode: ReportMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// "stderr" or "file"
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default = "default_log_file_path")]
    pub file_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

fn default_log_file_path() -> String {
    "./logs/gatewarden.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: default_log_file_path(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    /// Returns whether the file was found.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<(Self, bool), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load_from_file(path)?, true))
        } else {
            Ok((Self::default(), false))
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let monitor = &self.monitor;
        if monitor.interfaces.is_empty() {
            return Err(ConfigError::invalid(
                "monitor.interfaces",
                "at least one interface is required",
            ));
        }
        if let Some(bad) = monitor.interfaces.iter().find(|i| i.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "monitor.interfaces",
                format!("empty interface name {:?}", bad),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = monitor.interfaces.iter().find(|i| !seen.insert(i.as_str())) {
            return Err(ConfigError::invalid(
                "monitor.interfaces",
                format!("{} is listed twice", dup),
            ));
        }
        check_range(
            "monitor.tick_interval_ms",
            monitor.tick_interval_ms,
            1,
            MAX_TICK_INTERVAL_MS,
        )?;
        check_range("monitor.window_secs", monitor.window_secs, 1, MAX_SPAN_SECS)?;
        check_range("monitor.block_secs", monitor.block_secs, 1, MAX_SPAN_SECS)?;
        check_range(
            "monitor.reconcile_interval_secs",
            monitor.reconcile_interval_secs,
            0,
            MAX_SPAN_SECS,
        )?;

        let rules = &self.rules;
        if !rules.volume.enabled && !rules.pattern.enabled {
            return Err(ConfigError::invalid("rules", "no rule is enabled"));
        }
        if rules.volume.enabled && rules.volume.byte_threshold == 0 {
            return Err(ConfigError::invalid("rules.volume.byte_threshold", "must be > 0"));
        }
        if rules.pattern.enabled {
            if rules.pattern.limit == 0 {
                return Err(ConfigError::invalid("rules.pattern.limit", "must be > 0"));
            }
            let band = rules.pattern.band;
            if !band.is_satisfiable() {
                return Err(ConfigError::invalid(
                    "rules.pattern.band",
                    format!("no size lies strictly between {} and {}", band.above, band.below),
                ));
            }
        }

        if let Some(both) = self
            .sources
            .exempt
            .iter()
            .find(|addr| self.sources.watched.contains(addr))
        {
            return Err(ConfigError::invalid(
                "sources",
                format!("{} is both exempt and watched", both),
            ));
        }

        if self.enforcement.chain.trim().is_empty() {
            return Err(ConfigError::invalid("enforcement.chain", "must not be empty"));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::invalid(
                    "logging.format",
                    format!("unknown format '{}' (must be pretty/json)", other),
                ))
            }
        }
        match self.logging.output.as_str() {
            "stderr" | "file" => {}
            other => {
                return Err(ConfigError::invalid(
                    "logging.output",
                    format!("unknown output '{}' (must be stderr/file)", other),
                ))
            }
        }

        Ok(())
    }

    /// Legal but questionable settings, logged at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.monitor.block_secs < self.monitor.window_secs {
            warnings.push(format!(
                "block_secs ({}) is shorter than window_secs ({}): released sources may be re-blocked on their old traffic",
                self.monitor.block_secs, self.monitor.window_secs
            ));
        }
        if self.rules.pattern.enabled && self.rules.pattern.comparison == Comparison::Exact {
            warnings.push(format!(
                "pattern rule uses exact comparison: a source exceeding {} matches within one tick is not blocked",
                self.rules.pattern.limit
            ));
        }
        if self.report.mode == ReportMode::Table && self.logging.output == "stderr" {
            warnings.push(
                "table report and stderr logging share the terminal; set logging.output = \"file\" for a clean display"
                    .to_string(),
            );
        }
        warnings
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.monitor.window_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.monitor.block_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.tick_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.monitor.reconcile_interval_secs > 0)
            .then(|| Duration::from_secs(self.monitor.reconcile_interval_secs))
    }

    pub fn rule_set(&self) -> RuleSet {
        let mut rules = RuleSet::new(self.rules.combine);
        if self.rules.volume.enabled {
            rules = rules.with_rule(VolumeRule {
                byte_threshold: self.rules.volume.byte_threshold,
            });
        }
        if self.rules.pattern.enabled {
            rules = rules.with_rule(PatternCountRule {
                limit: self.rules.pattern.limit,
                comparison: self.rules.pattern.comparison,
            });
        }
        rules
    }

    pub fn source_policy(&self) -> SourcePolicy {
        SourcePolicy::new(
            self.sources.exempt.iter().copied(),
            self.sources.watched.iter().copied(),
        )
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::invalid(
            field,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────
