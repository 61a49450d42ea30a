//! Isolated network namespace environment
//!
//! One namespace, one veth pair and one host bridge shared by every
//! namespace-isolated interface. The inside end of the veth pair lives in
//! the namespace; the host end is enslaved to the bridge, which carries the
//! host address of the bridge-back subnet.
//!
//! The environment is reference counted by holder name: set up on the first
//! acquire, destroyed on the last release.

use crate::error::{BestEffort, Result};
use crate::shell::{args, CommandRunner, IPTABLES_CMD, IP_CMD};
use ipnet::{IpNet, Ipv4Net};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared namespace name
pub const NS_NAME: &str = "ns-wg";

/// Host-side bridge name
pub const BRIDGE_NAME: &str = "br-wg";

/// Host end of the veth pair
pub const VETH_HOST: &str = "veth-wg-br";

/// Namespace end of the veth pair
pub const VETH_NS: &str = "veth-wg";

/// Names and addresses of the bridge-back path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEnvironment {
    pub namespace: String,
    pub bridge: String,
    pub veth_host: String,
    pub veth_ns: String,
    /// Address on the bridge (host side)
    pub host_addr: Ipv4Net,
    /// Address on the namespace end of the veth
    pub ns_addr: Ipv4Net,
}

impl Default for NamespaceEnvironment {
    fn default() -> Self {
        Self {
            namespace: NS_NAME.to_string(),
            bridge: BRIDGE_NAME.to_string(),
            veth_host: VETH_HOST.to_string(),
            veth_ns: VETH_NS.to_string(),
            host_addr: Ipv4Net::new(Ipv4Addr::new(172, 31, 100, 1), 30)
                .unwrap_or_default(),
            ns_addr: Ipv4Net::new(Ipv4Addr::new(172, 31, 100, 2), 30)
                .unwrap_or_default(),
        }
    }
}

impl NamespaceEnvironment {
    /// The bridge-back subnet
    #[cfg(test)]
    pub fn subnet(&self) -> IpNet {
        IpNet::V4(self.host_addr.trunc())
    }

    /// Next hop on the host for traffic entering the namespace
    pub fn ns_gateway(&self) -> IpAddr {
        IpAddr::V4(self.ns_addr.addr())
    }

    /// Ordered setup steps as `ip`/`iptables` invocations
    fn setup_steps(&self) -> Vec<(&'static str, Vec<String>)> {
        let ns = self.namespace.as_str();
        let host_addr = self.host_addr.to_string();
        let ns_addr = self.ns_addr.to_string();
        let host_ip = self.host_addr.addr().to_string();

        vec![
            (IP_CMD, args(&["netns", "add", ns])),
            // veth pair, inside end moved into the namespace
            (IP_CMD, args(&["link", "add", &self.veth_ns, "type", "veth", "peer", "name", &self.veth_host])),
            (IP_CMD, args(&["link", "set", &self.veth_ns, "netns", ns])),
            (IP_CMD, args(&["-n", ns, "addr", "add", &ns_addr, "dev", &self.veth_ns])),
            (IP_CMD, args(&["-n", ns, "link", "set", &self.veth_ns, "up"])),
            (IP_CMD, args(&["-n", ns, "link", "set", "lo", "up"])),
            // bridge on the host side
            (IP_CMD, args(&["link", "add", &self.bridge, "type", "bridge"])),
            (IP_CMD, args(&["link", "set", &self.veth_host, "master", &self.bridge])),
            (IP_CMD, args(&["link", "set", &self.veth_host, "up"])),
            (IP_CMD, args(&["link", "set", &self.bridge, "up"])),
            (IP_CMD, args(&["addr", "add", &host_addr, "dev", &self.bridge])),
            // egress from the namespace
            (IP_CMD, args(&["-n", ns, "route", "add", "default", "via", &host_ip, "dev", &self.veth_ns])),
            (IP_CMD, args(&[
                "netns", "exec", ns, IPTABLES_CMD, "-w", "-t", "nat", "-A", "POSTROUTING",
                "-o", &self.veth_ns, "-j", "MASQUERADE",
            ])),
        ]
    }

    fn destroy_steps(&self) -> Vec<(&'static str, Vec<String>)> {
        vec![
            (IP_CMD, args(&["netns", "del", &self.namespace])),
            (IP_CMD, args(&["link", "set", &self.bridge, "down"])),
            (IP_CMD, args(&["link", "del", &self.bridge, "type", "bridge"])),
        ]
    }
}

#[derive(Debug, Default)]
struct HolderState {
    holders: BTreeSet<String>,
    active: bool,
}

/// Reference-counted owner of the shared namespace environment
pub struct NamespaceHelper {
    runner: Arc<dyn CommandRunner>,
    env: NamespaceEnvironment,
    state: Mutex<HolderState>,
}

impl NamespaceHelper {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_environment(runner, NamespaceEnvironment::default())
    }

    pub fn with_environment(runner: Arc<dyn CommandRunner>, env: NamespaceEnvironment) -> Self {
        Self {
            runner,
            env,
            state: Mutex::new(HolderState::default()),
        }
    }

    pub fn environment(&self) -> &NamespaceEnvironment {
        &self.env
    }

    /// Register `holder` as needing the environment, creating it if first
    pub async fn acquire(&self, holder: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.holders.contains(holder) {
            return Ok(());
        }

        if !state.active {
            tracing::info!(namespace = %self.env.namespace, holder, "Setting up namespace environment");
            if let Err(e) = self.setup().await {
                tracing::warn!(namespace = %self.env.namespace, error = %e, "Namespace setup failed, tearing down");
                self.destroy().await;
                return Err(e);
            }
            state.active = true;
        }

        state.holders.insert(holder.to_string());
        Ok(())
    }

    /// Drop `holder`'s claim, destroying the environment when none remain
    ///
    /// Returns true if the environment was destroyed.
    pub async fn release(&self, holder: &str) -> bool {
        let mut state = self.state.lock().await;

        if !state.holders.remove(holder) {
            return false;
        }

        if state.holders.is_empty() && state.active {
            tracing::info!(namespace = %self.env.namespace, holder, "Destroying namespace environment");
            self.destroy().await;
            state.active = false;
            return true;
        }

        false
    }

    /// Adopt holders of an environment set up by an earlier process
    pub async fn restore(&self, holders: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock().await;
        state.holders.extend(holders);
        state.active = !state.holders.is_empty();
    }

    #[cfg(test)]
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    #[cfg(test)]
    pub async fn holders(&self) -> Vec<String> {
        self.state.lock().await.holders.iter().cloned().collect()
    }

    /// Move a host link into the namespace and bring it up there
    pub async fn adopt_link(&self, link: &str) -> Result<()> {
        let _state = self.state.lock().await;
        let ns = self.env.namespace.as_str();
        self.runner
            .run_checked(IP_CMD, &args(&["link", "set", "dev", link, "netns", ns]))
            .await?;
        self.runner
            .run_checked(IP_CMD, &args(&["-n", ns, "link", "set", "dev", link, "up"]))
            .await?;
        Ok(())
    }

    /// Delete a link living inside the namespace
    pub async fn delete_link(&self, link: &str) -> BestEffort {
        let _state = self.state.lock().await;
        let ns = self.env.namespace.as_str();
        self.runner
            .run_checked(IP_CMD, &args(&["-n", ns, "link", "del", "dev", link]))
            .await
            .map(|_| ())
            .into()
    }

    /// Route `destination` to `device` inside the namespace
    pub async fn add_route(&self, destination: &IpNet, device: &str) -> BestEffort {
        let _state = self.state.lock().await;
        let family = match destination {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        };
        let dest = destination.to_string();
        let result = self
            .runner
            .run(
                IP_CMD,
                &args(&["-n", &self.env.namespace, family, "route", "replace", &dest, "dev", device]),
            )
            .await;
        match result {
            Ok(r) if r.success() => BestEffort::Done,
            Ok(r) => BestEffort::Ignored(crate::error::Error::KernelOperation {
                command: format!("ip -n {} route replace {} dev {}", self.env.namespace, dest, device),
                exit_code: r.exit_code,
                output: r.combined_output(),
            }),
            Err(e) => BestEffort::Ignored(e),
        }
    }

    async fn setup(&self) -> Result<()> {
        for (program, step) in self.env.setup_steps() {
            self.runner.run_checked(program, &step).await?;
        }
        Ok(())
    }

    /// Best-effort teardown; safe after a partial setup
    async fn destroy(&self) {
        for (program, step) in self.env.destroy_steps() {
            let outcome: BestEffort = self.runner.run_checked(program, &step).await.map(|_| ()).into();
            outcome.log("namespace teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::RecordingRunner;

    #[test]
    fn test_environment_addresses() {
        let env = NamespaceEnvironment::default();
        assert_eq!(env.subnet().to_string(), "172.31.100.0/30");
        assert_eq!(env.ns_gateway().to_string(), "172.31.100.2");
        assert_eq!(env.host_addr.to_string(), "172.31.100.1/30");
    }

    #[test]
    fn test_setup_steps_order() {
        let env = NamespaceEnvironment::default();
        let steps: Vec<String> = env
            .setup_steps()
            .iter()
            .map(|(p, a)| crate::shell::render(p, a))
            .collect();
        assert_eq!(steps[0], "/sbin/ip netns add ns-wg");
        assert!(steps.iter().any(|s| s == "/sbin/ip link set veth-wg netns ns-wg"));
        assert!(steps.iter().any(|s| s == "/sbin/ip addr add 172.31.100.1/30 dev br-wg"));
        assert!(steps
            .iter()
            .any(|s| s == "/sbin/ip -n ns-wg route add default via 172.31.100.1 dev veth-wg"));
        assert!(steps.last().unwrap().contains("POSTROUTING -o veth-wg -j MASQUERADE"));
    }

    #[tokio::test]
    async fn test_shared_between_holders() {
        let runner = Arc::new(RecordingRunner::new());
        let helper = NamespaceHelper::new(runner.clone());

        helper.acquire("wg0").await.unwrap();
        helper.acquire("wg1").await.unwrap();
        assert_eq!(runner.matching("netns add").len(), 1);
        assert!(helper.is_active().await);

        assert!(!helper.release("wg0").await);
        assert!(helper.is_active().await);
        assert!(runner.matching("netns del").is_empty());

        assert!(helper.release("wg1").await);
        assert!(!helper.is_active().await);
        assert_eq!(runner.matching("netns del").len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent_per_holder() {
        let runner = Arc::new(RecordingRunner::new());
        let helper = NamespaceHelper::new(runner.clone());

        helper.acquire("wg0").await.unwrap();
        helper.acquire("wg0").await.unwrap();
        assert_eq!(helper.holders().await, vec!["wg0".to_string()]);
        assert!(helper.release("wg0").await);
        assert!(!helper.release("wg0").await);
        assert_eq!(runner.matching("netns del").len(), 1);
    }

    #[tokio::test]
    async fn test_partial_setup_is_torn_down() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("type bridge");
        let helper = NamespaceHelper::new(runner.clone());

        assert!(helper.acquire("wg0").await.is_err());
        assert!(!helper.is_active().await);
        assert!(helper.holders().await.is_empty());
        assert_eq!(runner.matching("netns del").len(), 1);

        // A later acquire retries setup from scratch
        runner.clear_failures();
        helper.acquire("wg0").await.unwrap();
        assert_eq!(runner.matching("netns add").len(), 2);
    }

    #[tokio::test]
    async fn test_restored_environment_is_not_set_up_again() {
        let runner = Arc::new(RecordingRunner::new());
        let helper = NamespaceHelper::new(runner.clone());

        helper.restore(["wg0".to_string()]).await;
        helper.acquire("wg1").await.unwrap();
        assert!(runner.matching("netns add").is_empty());

        helper.release("wg0").await;
        assert!(helper.release("wg1").await);
        assert_eq!(runner.matching("netns del").len(), 1);
    }
}
