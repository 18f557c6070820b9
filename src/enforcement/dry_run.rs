use async_trait::async_trait;
use std::net::IpAddr;

use super::Enforcer;
use crate::error::EnforcementError;

/// Logs enforcement actions without touching the firewall.
#[derive(Debug, Default, Clone)]
pub struct DryRunEnforcer;

#[async_trait]
impl Enforcer for DryRunEnforcer {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn add_block(&self, source: IpAddr) -> Result<(), EnforcementError> {
        tracing::info!(%source, "[dry-run] would insert DROP rule");
        Ok(())
    }

    async fn remove_block(&self, source: IpAddr) -> Result<(), EnforcementError> {
        tracing::info!(%source, "[dry-run] would delete DROP rule");
        Ok(())
    }
}
