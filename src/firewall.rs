//! Firewall management for tunnel listen ports
//!
//! Rules live in a dedicated `FR_WIREGUARD` chain in the filter and nat
//! tables of both iptables and ip6tables, so the host's own ruleset is never
//! rewritten. Inserts and removals check for the exact rule first, which
//! keeps both operations idempotent.

use crate::error::{BestEffort, Result};
use crate::shell::{render, CommandRunner, IP6TABLES_CMD, IPTABLES_CMD};
use std::sync::Arc;

/// Chain holding every rule this system opens
pub const FIREWALL_CHAIN: &str = "FR_WIREGUARD";

/// Tables the chain exists in
const TABLES: &[&str] = &["filter", "nat"];

/// Binaries for each address family
const PROGRAMS: &[&str] = &[IPTABLES_CMD, IP6TABLES_CMD];

/// One accept rule for an interface's UDP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    /// `iptables` or `ip6tables` binary
    pub program: &'static str,
    /// Netfilter table (filter, nat)
    pub table: &'static str,
    pub chain: String,
    pub protocol: String,
    pub port: u16,
    /// Interface the rule belongs to (for logs)
    pub interface: String,
}

impl PortRule {
    /// Create a UDP accept rule in the shared chain
    pub fn udp(program: &'static str, table: &'static str, port: u16, interface: &str) -> Self {
        Self {
            program,
            table,
            chain: FIREWALL_CHAIN.to_string(),
            protocol: "udp".to_string(),
            port,
            interface: interface.to_string(),
        }
    }

    /// Every family/table variant for one port
    pub fn all_for(port: u16, interface: &str) -> Vec<PortRule> {
        PROGRAMS
            .iter()
            .flat_map(|program| {
                TABLES
                    .iter()
                    .map(move |table| PortRule::udp(*program, *table, port, interface))
            })
            .collect()
    }

    /// Argument vector for `-C`, `-A` or `-D`; identical apart from the action
    pub fn to_args(&self, action: &str) -> Vec<String> {
        vec![
            "-w".to_string(),
            "-t".to_string(),
            self.table.to_string(),
            action.to_string(),
            self.chain.clone(),
            "-p".to_string(),
            self.protocol.clone(),
            "--dport".to_string(),
            self.port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }
}

/// Opens and closes interface ports in the shared chain
pub struct FirewallManager {
    runner: Arc<dyn CommandRunner>,
}

impl FirewallManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Make sure the chain exists in every table; existing chains are fine
    pub async fn prepare(&self) {
        for program in PROGRAMS {
            for table in TABLES {
                let args: Vec<String> = ["-w", "-t", *table, "-N", FIREWALL_CHAIN]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                if let Ok(r) = self.runner.run(program, &args).await
                    && !r.success()
                    && !r.stderr.contains("already exists")
                {
                    tracing::debug!(program, table, stderr = %r.stderr, "Could not create firewall chain");
                }
            }
        }
    }

    /// Whether the exact rule is present
    async fn exists(&self, rule: &PortRule) -> Result<bool> {
        let result = self.runner.run(rule.program, &rule.to_args("-C")).await?;
        Ok(result.success())
    }

    /// Append a rule unless already present
    pub async fn insert(&self, rule: &PortRule) -> BestEffort {
        let outcome: Result<()> = async {
            if self.exists(rule).await? {
                return Ok(());
            }
            let args = rule.to_args("-A");
            self.runner.run_checked(rule.program, &args).await?;
            tracing::debug!(interface = %rule.interface, command = %render(rule.program, &args), "Firewall rule added");
            Ok(())
        }
        .await;
        outcome.into()
    }

    /// Delete a rule if present
    pub async fn remove(&self, rule: &PortRule) -> BestEffort {
        let outcome: Result<()> = async {
            if !self.exists(rule).await? {
                return Ok(());
            }
            self.runner.run_checked(rule.program, &rule.to_args("-D")).await?;
            Ok(())
        }
        .await;
        outcome.into()
    }

    /// Open `port` for `interface` in every family and table
    ///
    /// Returns how many of the rules failed.
    pub async fn open_port(&self, port: u16, interface: &str) -> usize {
        let mut failed = 0;
        for rule in PortRule::all_for(port, interface) {
            let outcome = self.insert(&rule).await;
            if !outcome.is_done() {
                failed += 1;
                outcome.log("firewall insert");
            }
        }
        failed
    }

    /// Close `port` for `interface` in every family and table
    pub async fn close_port(&self, port: u16, interface: &str) -> usize {
        let mut failed = 0;
        for rule in PortRule::all_for(port, interface) {
            let outcome = self.remove(&rule).await;
            if !outcome.is_done() {
                failed += 1;
                outcome.log("firewall removal");
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::RecordingRunner;

    #[test]
    fn test_rule_args() {
        let rule = PortRule::udp(IPTABLES_CMD, "filter", 51820, "wg0");
        assert_eq!(
            rule.to_args("-A").join(" "),
            "-w -t filter -A FR_WIREGUARD -p udp --dport 51820 -j ACCEPT"
        );
        let check = rule.to_args("-C");
        let delete = rule.to_args("-D");
        assert_eq!(check[4..], delete[4..]);
    }

    #[test]
    fn test_all_variants() {
        let rules = PortRule::all_for(443, "wg0");
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().any(|r| r.program == IP6TABLES_CMD && r.table == "nat"));
        assert!(rules.iter().all(|r| r.port == 443));
    }

    #[tokio::test]
    async fn test_insert_when_absent() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on(" -C ");
        let fw = FirewallManager::new(runner.clone());

        assert_eq!(fw.open_port(51820, "wg0").await, 0);
        assert_eq!(runner.matching(" -A FR_WIREGUARD").len(), 4);
    }

    #[tokio::test]
    async fn test_insert_skips_present_rule() {
        let runner = Arc::new(RecordingRunner::new());
        let fw = FirewallManager::new(runner.clone());

        assert!(fw.insert(&PortRule::udp(IPTABLES_CMD, "filter", 51820, "wg0")).await.is_done());
        assert!(runner.matching(" -A ").is_empty());
    }

    #[tokio::test]
    async fn test_remove_only_when_present() {
        let runner = Arc::new(RecordingRunner::new());
        let fw = FirewallManager::new(runner.clone());
        assert_eq!(fw.close_port(51820, "wg0").await, 0);
        assert_eq!(runner.matching(" -D FR_WIREGUARD").len(), 4);

        runner.clear();
        runner.fail_on(" -C ");
        assert_eq!(fw.close_port(51820, "wg0").await, 0);
        assert!(runner.matching(" -D ").is_empty());
    }

    #[tokio::test]
    async fn test_failed_append_is_counted() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on(" -C ");
        runner.fail_on("ip6tables -w -t nat -A");
        let fw = FirewallManager::new(runner.clone());
        assert_eq!(fw.open_port(51820, "wg0").await, 1);
    }
}
