//! DROP rules managed through `iptables` / `ip6tables`.
//!
//! Every add is preceded by a `-C` check so repeated adds (and periodic
//! reconciliation) never stack duplicate rules, and a remove for a rule that
//! is already gone succeeds without running `-D`. A check that fails for any
//! other reason is reported, never read as "absent".

use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Output;
use tokio::process::Command;

use super::Enforcer;
use crate::error::EnforcementError;

#[derive(Debug, Clone)]
pub struct IptablesEnforcer {
    iptables: String,
    ip6tables: String,
    chain: String,
}

impl IptablesEnforcer {
    pub fn new(
        iptables: impl Into<String>,
        ip6tables: impl Into<String>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
            chain: chain.into(),
        }
    }

    fn binary_for(&self, source: IpAddr) -> &str {
        match source {
            IpAddr::V4(_) => &self.iptables,
            IpAddr::V6(_) => &self.ip6tables,
        }
    }

    fn rule_args(&self, op: &str, source: IpAddr) -> Vec<String> {
        vec![
            op.to_string(),
            self.chain.clone(),
            "-s".to_string(),
            source.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }

    fn render(binary: &str, args: &[String]) -> String {
        format!("{} {}", binary, args.join(" "))
    }

    async fn run(&self, op: &str, source: IpAddr) -> Result<Output, EnforcementError> {
        let binary = self.binary_for(source);
        let args = self.rule_args(op, source);
        tracing::debug!(command = %Self::render(binary, &args), "Running firewall command");

        Command::new(binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EnforcementError::Spawn {
                command: Self::render(binary, &args),
                source,
            })
    }

    /// `-C` exits 0 when the rule exists and 1 when it does not. Anything
    /// else (xtables lock held, missing chain, no privileges) is an error.
    async fn rule_present(&self, source: IpAddr) -> Result<bool, EnforcementError> {
        let output = self.run("-C", source).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.rejected("-C", source, &output)),
        }
    }

    async fn run_checked(&self, op: &str, source: IpAddr) -> Result<(), EnforcementError> {
        let output = self.run(op, source).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(self.rejected(op, source, &output))
    }

    fn rejected(&self, op: &str, source: IpAddr, output: &Output) -> EnforcementError {
        EnforcementError::Rejected {
            command: Self::render(self.binary_for(source), &self.rule_args(op, source)),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

#[async_trait]
impl Enforcer for IptablesEnforcer {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn add_block(&self, source: IpAddr) -> Result<(), EnforcementError> {
        if self.rule_present(source).await? {
            tracing::debug!(%source, chain = %self.chain, "DROP rule already present");
            return Ok(());
        }
        self.run_checked("-I", source).await
    }

    async fn remove_block(&self, source: IpAddr) -> Result<(), EnforcementError> {
        if !self.rule_present(source).await? {
            tracing::debug!(%source, chain = %self.chain, "No DROP rule to delete");
            return Ok(());
        }
        self.run_checked("-D", source).await
    }
}
