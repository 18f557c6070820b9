//! Firewall control behind an async trait.
//!
//! Implementations must tolerate an add for an address that is already
//! blocked and a remove for one that is not; the block manager never retries.

pub mod dry_run;
pub mod iptables;

use async_trait::async_trait;
use std::net::IpAddr;

use crate::config::{EnforcementBackend, EnforcementConfig};
use crate::error::EnforcementError;

pub use dry_run::DryRunEnforcer;
pub use iptables::IptablesEnforcer;

#[async_trait]
pub trait Enforcer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn add_block(&self, source: IpAddr) -> Result<(), EnforcementError>;

    async fn remove_block(&self, source: IpAddr) -> Result<(), EnforcementError>;
}

/// Pick the enforcer for a configuration; `force_dry_run` overrides the backend.
pub fn from_config(config: &EnforcementConfig, force_dry_run: bool) -> Box<dyn Enforcer> {
    if force_dry_run {
        return Box::new(DryRunEnforcer);
    }
    match config.backend {
        EnforcementBackend::Iptables => Box::new(IptablesEnforcer::new(
            config.iptables_path.clone(),
            config.ip6tables_path.clone(),
            config.chain.clone(),
        )),
        EnforcementBackend::DryRun => Box::new(DryRunEnforcer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_backend() {
        let mut config = EnforcementConfig::default();
        assert_eq!(from_config(&config, false).name(), "iptables");
        assert_eq!(from_config(&config, true).name(), "dry-run");

        config.backend = EnforcementBackend::DryRun;
        assert_eq!(from_config(&config, false).name(), "dry-run");
    }
}
