//! Traffic-filter control for the kill switch.
//!
//! `IptablesFilter` drives `iptables`/`ip6tables`; `DryRunFilter` only logs the
//! commands it would have run.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::FirewallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Ipv4, AddressFamily::Ipv6];

    fn binary(self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "iptables",
            AddressFamily::Ipv6 => "ip6tables",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Input,
    Output,
    Forward,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Input, Chain::Output, Chain::Forward];

    fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

/// Default chain policy; the kill switch only ever closes chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Drop,
}

impl Policy {
    fn as_str(self) -> &'static str {
        match self {
            Policy::Drop => "DROP",
        }
    }
}

/// Packet filter operations used by the kill switch
#[async_trait::async_trait]
pub trait TrafficFilter: Send + Sync {
    /// Remove every rule in every chain of `family`
    async fn flush_rules(&self, family: AddressFamily) -> Result<(), FirewallError>;

    async fn set_default_policy(&self, family: AddressFamily, chain: Chain, policy: Policy)
    -> Result<(), FirewallError>;
}

/// Command line for a flush
pub fn flush_args() -> Vec<&'static str> {
    vec!["-F"]
}

/// Command line for a default-policy change
pub fn policy_args(chain: Chain, policy: Policy) -> Vec<&'static str> {
    vec!["-P", chain.as_str(), policy.as_str()]
}

pub struct IptablesFilter {
    command_timeout: Duration,
}

impl IptablesFilter {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run(&self, family: AddressFamily, args: &[&str]) -> Result<(), FirewallError> {
        let command = format!("{} {}", family.binary(), args.join(" "));
        debug!("running {}", command);

        let mut child = Command::new(family.binary());
        child.args(args).kill_on_drop(true);

        let output = timeout(self.command_timeout, child.output())
            .await
            .map_err(|_| FirewallError::Timeout {
                command: command.clone(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| FirewallError::Spawn { command: command.clone(), source })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FirewallError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl TrafficFilter for IptablesFilter {
    async fn flush_rules(&self, family: AddressFamily) -> Result<(), FirewallError> {
        self.run(family, &flush_args()).await
    }

    async fn set_default_policy(
        &self,
        family: AddressFamily,
        chain: Chain,
        policy: Policy,
    ) -> Result<(), FirewallError> {
        self.run(family, &policy_args(chain, policy)).await
    }
}

/// Logs instead of touching the firewall
pub struct DryRunFilter;

#[async_trait::async_trait]
impl TrafficFilter for DryRunFilter {
    async fn flush_rules(&self, family: AddressFamily) -> Result<(), FirewallError> {
        warn!("dry run: would run `{} {}`", family.binary(), flush_args().join(" "));
        Ok(())
    }

    async fn set_default_policy(
        &self,
        family: AddressFamily,
        chain: Chain,
        policy: Policy,
    ) -> Result<(), FirewallError> {
        info!("dry run: would run `{} {}`", family.binary(), policy_args(chain, policy).join(" "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_args() {
        assert_eq!(policy_args(Chain::Output, Policy::Drop), vec!["-P", "OUTPUT", "DROP"]);
        assert_eq!(policy_args(Chain::Forward, Policy::Drop), vec!["-P", "FORWARD", "DROP"]);
        assert_eq!(flush_args(), vec!["-F"]);
    }

    #[test]
    fn test_binaries_per_family() {
        assert_eq!(AddressFamily::Ipv4.binary(), "iptables");
        assert_eq!(AddressFamily::Ipv6.binary(), "ip6tables");
    }

    #[tokio::test]
    async fn test_dry_run_never_fails() {
        let filter = DryRunFilter;
        for family in AddressFamily::ALL {
            filter.flush_rules(family).await.unwrap();
            for chain in Chain::ALL {
                filter.set_default_policy(family, chain, Policy::Drop).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_bad_invocation_is_an_error() {
        let filter = IptablesFilter::new(Duration::from_secs(5));
        let err = filter.run(AddressFamily::Ipv4, &["--definitely-not-a-flag"]).await;
        // either the binary is absent or it rejects the flag; both are hard errors
        assert!(err.is_err());
    }
}
