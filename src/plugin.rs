//! Interface plugins
//!
//! One plugin instance drives one logical interface through its lifecycle:
//! create the kernel object, install the routes its role implies, report
//! its operational state, and flush everything again.
//!
//! Provides:
//! - `InterfacePlugin` trait shared by every interface kind
//! - `PluginContext` with the shared kernel-facing services
//! - Per-kind `prepare` run once before any interface of that kind is applied

pub mod generic;
pub mod wireguard;

pub use generic::GenericPlugin;
pub use wireguard::WireguardPlugin;

use crate::error::{BestEffort, Error, Result};
use crate::firewall::FirewallManager;
use crate::manifest::Settings;
use crate::namespace::NamespaceHelper;
use crate::netconfig::{InterfaceConfig, InterfaceKind, KindConfig, Role};
use crate::routing::{Route, RoutingCoordinator, TableName};
use crate::shell::{args, render, CommandRunner, IP_CMD};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Shared services handed to every plugin
#[derive(Clone)]
pub struct PluginContext {
    pub runner: Arc<dyn CommandRunner>,
    pub routing: Arc<RoutingCoordinator>,
    pub namespace: Arc<NamespaceHelper>,
    pub firewall: Arc<FirewallManager>,
    pub settings: Arc<Settings>,
}

impl PluginContext {
    /// Wire up every service around one command runner
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        let routing = RoutingCoordinator::new(
            runner.clone(),
            &settings.routing,
            &settings.config.rt_tables,
        );
        Self {
            routing: Arc::new(routing),
            namespace: Arc::new(NamespaceHelper::new(runner.clone())),
            firewall: Arc::new(FirewallManager::new(runner.clone())),
            settings: Arc::new(settings),
            runner,
        }
    }

    /// Run `ip` and fail on non-zero exit
    pub async fn ip(&self, parts: &[&str]) -> Result<String> {
        self.runner.run_checked(IP_CMD, &args(parts)).await
    }

    /// Run `ip` where failure is acceptable
    pub async fn ip_best_effort(&self, parts: &[&str]) -> BestEffort {
        self.ip(parts).await.map(|_| ()).into()
    }

    /// Create a link, treating an existing one as success
    pub async fn add_link(&self, parts: &[&str]) -> Result<()> {
        let argv = args(parts);
        let result = self.runner.run(IP_CMD, &argv).await?;
        if result.success() || result.stderr.contains("File exists") {
            Ok(())
        } else {
            Err(Error::KernelOperation {
                command: render(IP_CMD, &argv),
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }
}

/// Operational snapshot of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceState {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    /// Whether the kernel link was found
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operstate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Lifecycle of one logical interface
///
/// Every operation must be safe when the kernel object is already absent.
#[async_trait]
pub trait InterfacePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &InterfaceConfig;

    fn context(&self) -> &PluginContext;

    /// Namespace the kernel link lives in, if not the host's
    fn namespace(&self) -> Option<&str> {
        None
    }

    /// Host routes implied by the configuration
    fn routes(&self) -> Vec<Route>;

    /// Create and configure the kernel object
    async fn create(&mut self) -> Result<()>;

    /// Install the routes implied by the role; returns the failure count
    async fn apply_routes(&mut self) -> usize {
        if !self.config().enabled {
            return 0;
        }
        install_routes(self.context(), self.routes()).await
    }

    /// Undo everything `create` and `apply_routes` did; never fails
    async fn flush(&mut self);

    async fn state(&self) -> InterfaceState {
        link_state(self.context(), self.name(), self.config(), self.namespace()).await
    }

    /// Error for a configuration defect found before any kernel mutation
    fn fatal(&self, message: String) -> Error {
        tracing::error!(interface = %self.name(), message = %message, "Fatal interface configuration");
        Error::Fatal {
            interface: self.name().to_string(),
            message,
        }
    }
}

/// Build the plugin for an interface
pub fn build(
    name: &str,
    config: &InterfaceConfig,
    master: Option<&str>,
    ctx: &PluginContext,
) -> Box<dyn InterfacePlugin> {
    match &config.kind {
        KindConfig::Wireguard(_) => Box::new(WireguardPlugin::new(name, config.clone(), ctx.clone())),
        _ => Box::new(GenericPlugin::new(
            name,
            config.clone(),
            master.map(str::to_string),
            ctx.clone(),
        )),
    }
}

/// Kind-wide environment checks, run once per kind per process
pub async fn prepare(kind: InterfaceKind, ctx: &PluginContext) -> Result<()> {
    ctx.routing.ensure_tables().await.log("routing table registration");
    ctx.firewall.prepare().await;

    match kind {
        InterfaceKind::Wireguard => wireguard::prepare(ctx).await,
        InterfaceKind::Physical | InterfaceKind::Bridge | InterfaceKind::Vlan => Ok(()),
    }
}

/// Routes a role implies for a set of destinations on `device`
///
/// LAN destinations go into both routable tables, WAN destinations into
/// the interface's private default table.
pub fn role_routes(
    name: &str,
    role: Role,
    destinations: &[IpNet],
    device: &str,
    gateway: Option<IpAddr>,
) -> Vec<Route> {
    let tables = match role {
        Role::Lan => vec![TableName::LanRoutable, TableName::WanRoutable],
        Role::Wan => vec![TableName::interface_default(name)],
        Role::None => return Vec::new(),
    };

    let mut routes = Vec::new();
    for destination in destinations {
        for table in &tables {
            let mut route = Route::new(*destination, device, table.clone());
            if let Some(gw) = gateway {
                route = route.via(gw);
            }
            routes.push(route);
        }
    }
    routes
}

/// Connected subnets of an interface's addresses
pub fn connected_subnets(config: &InterfaceConfig) -> Vec<IpNet> {
    let mut subnets: Vec<IpNet> = config.addresses().iter().map(IpNet::trunc).collect();
    subnets.sort();
    subnets.dedup();
    subnets
}

/// Install routes, logging and counting failures
pub async fn install_routes(ctx: &PluginContext, routes: Vec<Route>) -> usize {
    let mut failed = 0;
    for route in routes {
        let outcome = ctx.routing.add_route(route).await;
        if !outcome.is_done() {
            failed += 1;
            outcome.log("route insert");
        }
    }
    failed
}

/// Remove routes computed from configuration plus anything still tracked for `device`
///
/// A WAN interface's private table is emptied completely.
pub async fn remove_routes(ctx: &PluginContext, routes: Vec<Route>, device: &str) {
    let private = TableName::interface_default(device);
    let owns_table = routes.iter().any(|r| r.table == private);
    for route in routes {
        ctx.routing.remove_route(&route).await.log("route removal");
    }
    if owns_table {
        ctx.routing.flush_table(&private).await;
    }
    let removed = ctx.routing.remove_device_routes(device).await;
    if removed > 0 {
        tracing::debug!(device, removed, "Removed leftover routes");
    }
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    operstate: Option<String>,
    #[serde(default)]
    mtu: Option<u32>,
}

/// Query `ip -j link show` for one link
pub async fn link_state(
    ctx: &PluginContext,
    name: &str,
    config: &InterfaceConfig,
    namespace: Option<&str>,
) -> InterfaceState {
    let mut parts = Vec::new();
    if let Some(ns) = namespace {
        parts.extend(["-n", ns]);
    }
    parts.extend(["-j", "link", "show", "dev", name]);

    let info = match ctx.ip(&parts).await {
        Ok(out) => serde_json::from_str::<Vec<LinkInfo>>(&out)
            .ok()
            .and_then(|links| links.into_iter().next()),
        Err(e) => {
            tracing::debug!(interface = %name, error = %e, "Link not found");
            None
        }
    };

    InterfaceState {
        name: name.to_string(),
        kind: config.kind().to_string(),
        enabled: config.enabled,
        present: info.is_some(),
        mac: info.as_ref().and_then(|i| i.address.clone()),
        operstate: info.as_ref().and_then(|i| i.operstate.clone()),
        mtu: info.as_ref().and_then(|i| i.mtu),
        namespace: namespace.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::RecordingRunner;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    pub(crate) fn test_context(runner: Arc<RecordingRunner>, dir: &std::path::Path) -> PluginContext {
        let mut settings = Settings::default();
        settings.config.data_dir = dir.join("data");
        settings.config.config_dir = dir.join("etc");
        settings.config.rt_tables = dir.join("rt_tables");
        PluginContext::new(runner, settings)
    }

    #[test]
    fn test_lan_routes_are_symmetric() {
        let routes = role_routes("wg0", Role::Lan, &[net("10.0.5.0/24")], "wg0", None);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].table, TableName::LanRoutable);
        assert_eq!(routes[1].table, TableName::WanRoutable);
        assert_eq!(routes[0].destination, routes[1].destination);
    }

    #[test]
    fn test_wan_routes_use_private_table() {
        let routes = role_routes("eth0", Role::Wan, &[net("0.0.0.0/0")], "eth0", "192.0.2.1".parse().ok());
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].table, TableName::interface_default("eth0"));
        assert_eq!(routes[0].gateway, "192.0.2.1".parse().ok());
        assert!(role_routes("eth0", Role::None, &[net("10.0.0.0/8")], "eth0", None).is_empty());
    }

    #[test]
    fn test_connected_subnets() {
        let mut config = InterfaceConfig::new(KindConfig::Physical);
        config.ipv4 = vec!["192.168.1.1/24".into(), "192.168.1.2/24".into()];
        config.ipv6 = vec!["fd00::1/64".into()];
        assert_eq!(
            connected_subnets(&config),
            vec![net("192.168.1.0/24"), net("fd00::/64")]
        );
    }

    #[tokio::test]
    async fn test_link_state_parses_json() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(
            "link show dev eth0",
            r#"[{"ifindex":2,"ifname":"eth0","mtu":1500,"operstate":"UP","address":"52:54:00:12:34:56"}]"#,
        );
        let ctx = test_context(runner, dir.path());
        let config = InterfaceConfig::new(KindConfig::Physical);

        let state = link_state(&ctx, "eth0", &config, None).await;
        assert!(state.present);
        assert_eq!(state.mtu, Some(1500));
        assert_eq!(state.operstate.as_deref(), Some("UP"));
        assert_eq!(state.kind, "physical");
    }

    #[tokio::test]
    async fn test_link_state_missing_link() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_with("link show", "Device \"eth9\" does not exist.");
        let ctx = test_context(runner, dir.path());

        let state = link_state(&ctx, "eth9", &InterfaceConfig::new(KindConfig::Physical), None).await;
        assert!(!state.present);
        assert!(state.mac.is_none());
    }

    #[tokio::test]
    async fn test_add_link_tolerates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_with("link add", "RTNETLINK answers: File exists");
        let ctx = test_context(runner.clone(), dir.path());
        assert!(ctx.add_link(&["link", "add", "name", "br0", "type", "bridge"]).await.is_ok());

        runner.clear_failures();
        runner.fail_with("link add", "RTNETLINK answers: Operation not permitted");
        assert!(ctx.add_link(&["link", "add", "name", "br0", "type", "bridge"]).await.is_err());
    }
}
