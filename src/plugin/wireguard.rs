//! WireGuard tunnel interfaces
//!
//! A tunnel gets its own config file under `<config_dir>/wireguard`, loaded
//! with `wg setconf`. With `nsMode` the link is moved into the shared
//! isolated namespace after configuration, and the host reaches its peers
//! through the namespace bridge.

use super::{
    connected_subnets, install_routes, link_state, remove_routes, role_routes, InterfacePlugin,
    InterfaceState, PluginContext,
};
use crate::error::{Error, Result};
use crate::netconfig::{InterfaceConfig, KindConfig, WireguardConfig};
use crate::routing::Route;
use crate::shell::{MODPROBE_CMD, WG_CMD};
use async_trait::async_trait;
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Load the kernel module and create the config directory
pub async fn prepare(ctx: &PluginContext) -> Result<()> {
    ctx.runner
        .run_checked(MODPROBE_CMD, &["wireguard".to_string()])
        .await
        .map_err(|e| Error::environment("wireguard", e.to_string()))?;

    let dir = ctx.settings.config.wireguard_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::environment("wireguard", format!("{}: {}", dir.display(), e)))?;
    Ok(())
}

/// Render the `wg setconf` file for a tunnel
pub fn render_config(wg: &WireguardConfig) -> String {
    let mut out = String::from("[Interface]\n");
    if let Some(key) = &wg.private_key {
        let _ = writeln!(out, "PrivateKey = {}", key);
    }
    if let Some(port) = wg.listen_port {
        let _ = writeln!(out, "ListenPort = {}", port);
    }
    out.push('\n');

    for peer in &wg.peers {
        out.push_str("[Peer]\n");
        if let Some(key) = &peer.public_key {
            let _ = writeln!(out, "PublicKey = {}", key);
        }
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(out, "PresharedKey = {}", psk);
        }
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if !peer.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
        out.push('\n');
    }
    out
}

/// Stable locally administered MAC for a link without one
pub fn synthetic_mac(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut mac = String::from("02");
    for byte in &digest[..5] {
        let _ = write!(mac, ":{:02x}", byte);
    }
    mac
}

pub struct WireguardPlugin {
    name: String,
    config: InterfaceConfig,
    wg: WireguardConfig,
    ctx: PluginContext,
}

impl WireguardPlugin {
    pub fn new(name: &str, config: InterfaceConfig, ctx: PluginContext) -> Self {
        let wg = match &config.kind {
            KindConfig::Wireguard(wg) => wg.clone(),
            _ => WireguardConfig::default(),
        };
        Self {
            name: name.to_string(),
            config,
            wg,
            ctx,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.ctx
            .settings
            .config
            .wireguard_dir()
            .join(format!("{}.conf", self.name))
    }

    /// Listening tunnels in `nsMode` run inside the shared namespace
    fn isolated(&self) -> bool {
        self.wg.ns_mode && self.listening()
    }

    fn listening(&self) -> bool {
        self.config.enabled && self.wg.listen_port.is_some()
    }

    fn allowed_destinations(&self) -> Vec<IpNet> {
        let mut nets: Vec<IpNet> = self.wg.peers.iter().flat_map(|p| p.allowed_nets()).collect();
        nets.sort();
        nets.dedup();
        nets
    }

    fn check_preconditions(&self) -> Result<()> {
        if self.wg.private_key.as_deref().is_none_or(str::is_empty) {
            return Err(self.fatal(format!(
                "Private key is not specified for Wireguard interface {}",
                self.name
            )));
        }
        for (idx, peer) in self.wg.peers.iter().enumerate() {
            if peer.public_key.as_deref().is_none_or(str::is_empty) {
                return Err(self.fatal(format!(
                    "publicKey of peer {} in Wireguard interface {} is not specified",
                    idx, self.name
                )));
            }
        }
        Ok(())
    }

    async fn write_config(&self) -> Result<()> {
        let path = self.config_path();
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        file.write_all(render_config(&self.wg).as_bytes()).await?;
        file.flush().await?;
        tracing::debug!(interface = %self.name, path = %path.display(), "Wrote tunnel config");
        Ok(())
    }

    /// Addresses, MTU and link state, in whichever namespace the link lives
    async fn configure_link(&self) -> Result<()> {
        let ns_prefix: Vec<&str> = match self.namespace() {
            Some(ns) => vec!["-n", ns],
            None => Vec::new(),
        };

        if let Some(mtu) = self.config.mtu {
            let mtu = mtu.to_string();
            let mut parts = ns_prefix.clone();
            parts.extend(["link", "set", "dev", self.name.as_str(), "mtu", mtu.as_str()]);
            self.ctx.ip(&parts).await?;
        }

        for addr in self.config.addresses() {
            let addr = addr.to_string();
            let mut parts = ns_prefix.clone();
            parts.extend(["addr", "replace", addr.as_str(), "dev", self.name.as_str()]);
            self.ctx.ip(&parts).await?;
        }

        if !self.isolated() {
            let updown = if self.config.enabled { "up" } else { "down" };
            self.ctx
                .ip(&["link", "set", "dev", &self.name, updown])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl InterfacePlugin for WireguardPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    fn context(&self) -> &PluginContext {
        &self.ctx
    }

    fn namespace(&self) -> Option<&str> {
        if self.isolated() {
            Some(self.ctx.namespace.environment().namespace.as_str())
        } else {
            None
        }
    }

    fn routes(&self) -> Vec<Route> {
        if self.isolated() {
            // Host side reaches isolated peers through the namespace bridge
            let env = self.ctx.namespace.environment();
            return role_routes(
                &self.name,
                self.config.role,
                &self.allowed_destinations(),
                &env.bridge,
                Some(env.ns_gateway()),
            );
        }

        let mut destinations = connected_subnets(&self.config);
        destinations.extend(self.allowed_destinations());
        destinations.sort();
        destinations.dedup();
        role_routes(&self.name, self.config.role, &destinations, &self.name, None)
    }

    async fn create(&mut self) -> Result<()> {
        self.check_preconditions()?;
        tracing::info!(
            interface = %self.name,
            peers = self.wg.peers.len(),
            isolated = self.isolated(),
            "Creating tunnel"
        );

        self.ctx
            .add_link(&["link", "add", "dev", &self.name, "type", "wireguard"])
            .await?;
        self.write_config().await?;

        if self.listening() {
            if self.isolated() {
                self.ctx.namespace.acquire(&self.name).await?;
            }
            if let Some(port) = self.wg.firewall_port() {
                self.ctx.firewall.open_port(port, &self.name).await;
            }
        }

        let path = self.config_path();
        self.ctx
            .runner
            .run_checked(
                WG_CMD,
                &["setconf".to_string(), self.name.clone(), path.display().to_string()],
            )
            .await?;

        if self.isolated() {
            self.ctx.namespace.adopt_link(&self.name).await?;
        }
        self.configure_link().await
    }

    async fn apply_routes(&mut self) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let mut failed = install_routes(&self.ctx, self.routes()).await;

        if self.isolated() {
            for destination in self.allowed_destinations() {
                let outcome = self.ctx.namespace.add_route(&destination, &self.name).await;
                if !outcome.is_done() {
                    failed += 1;
                    outcome.log("namespace route insert");
                }
            }
        }
        failed
    }

    async fn flush(&mut self) {
        tracing::info!(interface = %self.name, "Flushing tunnel");
        remove_routes(&self.ctx, self.routes(), &self.name).await;

        if self.listening()
            && let Some(port) = self.wg.firewall_port()
        {
            self.ctx.firewall.close_port(port, &self.name).await;
        }

        if self.isolated() {
            self.ctx.namespace.delete_link(&self.name).await.log("namespace link delete");
        }
        let host_delete = self.ctx.ip_best_effort(&["link", "del", "dev", &self.name]).await;
        if !self.isolated() {
            host_delete.log("link delete");
        }

        if self.isolated() {
            self.ctx.namespace.release(&self.name).await;
        }

        match tokio::fs::remove_file(self.config_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(interface = %self.name, error = %e, "Failed to remove tunnel config"),
        }
    }

    async fn state(&self) -> InterfaceState {
        let mut state = link_state(&self.ctx, &self.name, &self.config, self.namespace()).await;
        if state.mac.is_none() {
            state.mac = Some(synthetic_mac(&self.name));
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netconfig::{Peer, Role};
    use crate::plugin::tests::test_context;
    use crate::routing::TableName;
    use crate::shell::RecordingRunner;
    use std::sync::Arc;

    fn tunnel(port: Option<u32>, ns_mode: bool) -> InterfaceConfig {
        InterfaceConfig::new(KindConfig::Wireguard(WireguardConfig {
            private_key: Some("k1".into()),
            listen_port: port,
            firewall_port: None,
            ns_mode,
            peers: vec![Peer {
                public_key: Some("p1".into()),
                allowed_ips: vec!["10.0.5.0/24".into()],
                ..Default::default()
            }],
        }))
        .with_role(Role::Lan)
    }

    async fn prepared(runner: Arc<RecordingRunner>, dir: &std::path::Path) -> PluginContext {
        let ctx = test_context(runner, dir);
        prepare(&ctx).await.unwrap();
        ctx
    }

    #[test]
    fn test_render_config() {
        let KindConfig::Wireguard(mut wg) = tunnel(Some(51820), false).kind else {
            panic!("expected wireguard");
        };
        wg.peers[0].endpoint = Some("198.51.100.7:51820".into());
        wg.peers[0].allowed_ips.push("fd00:5::/64".into());
        wg.peers[0].persistent_keepalive = Some(25);

        assert_eq!(
            render_config(&wg),
            "[Interface]\nPrivateKey = k1\nListenPort = 51820\n\n\
             [Peer]\nPublicKey = p1\nEndpoint = 198.51.100.7:51820\n\
             AllowedIPs = 10.0.5.0/24, fd00:5::/64\nPersistentKeepalive = 25\n\n"
        );
    }

    #[test]
    fn test_synthetic_mac_is_stable() {
        let mac = synthetic_mac("wg0");
        assert_eq!(mac, synthetic_mac("wg0"));
        assert_ne!(mac, synthetic_mac("wg1"));
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.len(), 17);
    }

    #[tokio::test]
    async fn test_wg0_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on(" -C ");
        let ctx = prepared(runner.clone(), dir.path()).await;
        let mut plugin = WireguardPlugin::new("wg0", tunnel(Some(51820), false), ctx.clone());

        plugin.create().await.unwrap();
        assert_eq!(plugin.apply_routes().await, 0);

        let conf = std::fs::read_to_string(plugin.config_path()).unwrap();
        assert!(conf.contains("ListenPort = 51820"));
        assert!(conf.contains("AllowedIPs = 10.0.5.0/24"));
        assert_eq!(runner.matching("wg setconf wg0").len(), 1);
        assert_eq!(runner.matching("--dport 51820 -j ACCEPT").len(), 8);

        for table in [TableName::LanRoutable, TableName::WanRoutable] {
            let routes = ctx.routing.installed(&table).await;
            assert_eq!(routes.len(), 1);
            assert_eq!(routes[0].destination.to_string(), "10.0.5.0/24");
            assert_eq!(routes[0].device, "wg0");
        }
    }

    #[tokio::test]
    async fn test_missing_private_key_is_fatal_before_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = prepared(runner.clone(), dir.path()).await;
        runner.clear();

        let mut config = tunnel(Some(51820), false);
        if let KindConfig::Wireguard(wg) = &mut config.kind {
            wg.private_key = None;
        }
        let mut plugin = WireguardPlugin::new("wg0", config, ctx);
        assert!(matches!(plugin.create().await, Err(Error::Fatal { .. })));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_firewall_port_override() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on(" -C ");
        let ctx = prepared(runner.clone(), dir.path()).await;

        let mut config = tunnel(Some(51820), false);
        if let KindConfig::Wireguard(wg) = &mut config.kind {
            wg.firewall_port = Some(443);
        }
        let mut plugin = WireguardPlugin::new("wg0", config, ctx);
        plugin.create().await.unwrap();

        assert_eq!(runner.matching("-A FR_WIREGUARD -p udp --dport 443").len(), 4);
        assert!(runner.matching("--dport 51820").is_empty());
    }

    #[tokio::test]
    async fn test_no_firewall_without_listen_port() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = prepared(runner.clone(), dir.path()).await;
        let mut plugin = WireguardPlugin::new("wg0", tunnel(None, false), ctx);

        plugin.create().await.unwrap();
        plugin.flush().await;
        assert!(runner.matching("FR_WIREGUARD -p udp").is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tunnel_leaves_port_rules_alone() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = prepared(runner.clone(), dir.path()).await;
        let mut config = tunnel(Some(51820), false);
        config.enabled = false;
        let mut plugin = WireguardPlugin::new("wg1", config, ctx);

        plugin.create().await.unwrap();
        plugin.flush().await;
        assert!(runner.matching("--dport 51820").is_empty());
    }

    #[tokio::test]
    async fn test_create_flush_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = prepared(runner.clone(), dir.path()).await;
        let mut plugin = WireguardPlugin::new("wg0", tunnel(Some(51820), false), ctx.clone());

        plugin.create().await.unwrap();
        let _ = plugin.apply_routes().await;
        let first_conf = std::fs::read_to_string(plugin.config_path()).unwrap();
        let first_routes = ctx.routing.installed(&TableName::LanRoutable).await;

        plugin.flush().await;
        assert!(!plugin.config_path().exists());
        assert!(ctx.routing.installed(&TableName::LanRoutable).await.is_empty());
        assert!(ctx.routing.installed(&TableName::WanRoutable).await.is_empty());

        plugin.create().await.unwrap();
        let _ = plugin.apply_routes().await;
        assert_eq!(std::fs::read_to_string(plugin.config_path()).unwrap(), first_conf);
        assert_eq!(ctx.routing.installed(&TableName::LanRoutable).await, first_routes);
    }

    #[tokio::test]
    async fn test_isolated_tunnels_share_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = prepared(runner.clone(), dir.path()).await;
        let mut wg0 = WireguardPlugin::new("wg0", tunnel(Some(51820), true), ctx.clone());
        let mut wg1 = WireguardPlugin::new("wg1", tunnel(Some(51821), true), ctx.clone());

        wg0.create().await.unwrap();
        wg1.create().await.unwrap();
        assert_eq!(runner.matching("netns add ns-wg").len(), 1);
        assert_eq!(runner.matching("link set dev wg1 netns ns-wg").len(), 1);
        assert_eq!(wg0.namespace(), Some("ns-wg"));

        let _ = wg0.apply_routes().await;
        let lan = ctx.routing.installed(&TableName::LanRoutable).await;
        assert_eq!(lan[0].device, "br-wg");
        assert_eq!(lan[0].gateway.map(|g| g.to_string()).as_deref(), Some("172.31.100.2"));
        assert_eq!(runner.matching("ip -n ns-wg -4 route replace 10.0.5.0/24 dev wg0").len(), 1);

        wg0.flush().await;
        assert!(ctx.namespace.is_active().await);
        assert!(runner.matching("netns del").is_empty());

        wg1.flush().await;
        assert!(!ctx.namespace.is_active().await);
        assert_eq!(runner.matching("netns del ns-wg").len(), 1);
    }

    #[tokio::test]
    async fn test_state_reports_synthetic_mac() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("link show dev wg0", r#"[{"ifname":"wg0","mtu":1420,"operstate":"UNKNOWN"}]"#);
        let ctx = prepared(runner, dir.path()).await;
        let plugin = WireguardPlugin::new("wg0", tunnel(Some(51820), false), ctx);

        let state = plugin.state().await;
        assert!(state.present);
        assert_eq!(state.mac, Some(synthetic_mac("wg0")));
        assert_eq!(state.mtu, Some(1420));
    }
}
