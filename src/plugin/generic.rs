//! Physical, bridge and VLAN interfaces

use super::{connected_subnets, remove_routes, role_routes, InterfacePlugin, PluginContext};
use crate::error::Result;
use crate::netconfig::{InterfaceConfig, KindConfig, Role};
use crate::routing::{Route, TableName};
use async_trait::async_trait;
use ipnet::IpNet;

/// Plugin for every link kind that needs only `ip link` and `ip addr`
pub struct GenericPlugin {
    name: String,
    config: InterfaceConfig,
    /// Bridge this link is enslaved to
    master: Option<String>,
    ctx: PluginContext,
}

impl GenericPlugin {
    pub fn new(name: &str, config: InterfaceConfig, master: Option<String>, ctx: PluginContext) -> Self {
        Self {
            name: name.to_string(),
            config,
            master,
            ctx,
        }
    }

    /// Whether flush should delete the link rather than just set it down
    fn owns_link(&self) -> bool {
        matches!(self.config.kind, KindConfig::Bridge(_) | KindConfig::Vlan(_))
    }

    async fn create_link(&self) -> Result<()> {
        match &self.config.kind {
            KindConfig::Bridge(_) => {
                self.ctx
                    .add_link(&["link", "add", "name", &self.name, "type", "bridge"])
                    .await
            }
            KindConfig::Vlan(vlan) => {
                let (Some(parent), Some(vid)) = (vlan.parent.as_deref(), vlan.vid) else {
                    return Err(self.fatal(format!(
                        "VLAN interface {} needs both parent and vid",
                        self.name
                    )));
                };
                let vid = vid.to_string();
                self.ctx
                    .add_link(&["link", "add", "link", parent, "name", &self.name, "type", "vlan", "id", &vid])
                    .await
            }
            KindConfig::Physical | KindConfig::Wireguard(_) => Ok(()),
        }
    }
}

#[async_trait]
impl InterfacePlugin for GenericPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    fn context(&self) -> &PluginContext {
        &self.ctx
    }

    fn routes(&self) -> Vec<Route> {
        let subnets = connected_subnets(&self.config);
        let mut routes = role_routes(&self.name, self.config.role, &subnets, &self.name, None);

        if self.config.role == Role::Wan {
            let table = TableName::interface_default(&self.name);
            let defaults = [
                (self.config.gateway, IpNet::V4(Default::default())),
                (self.config.gateway6, IpNet::V6(Default::default())),
            ];
            for (gateway, any) in defaults {
                if let Some(gw) = gateway {
                    routes.push(Route::new(any, &self.name, table.clone()).via(gw));
                }
            }
        }
        routes
    }

    async fn create(&mut self) -> Result<()> {
        tracing::info!(interface = %self.name, kind = %self.config.kind(), "Creating interface");
        self.create_link().await?;

        if let Some(master) = &self.master {
            self.ctx
                .ip(&["link", "set", "dev", &self.name, "master", master])
                .await?;
        }

        if let Some(mtu) = self.config.mtu {
            let mtu = mtu.to_string();
            self.ctx
                .ip(&["link", "set", "dev", &self.name, "mtu", &mtu])
                .await?;
        }

        for addr in self.config.addresses() {
            let addr = addr.to_string();
            self.ctx
                .ip(&["addr", "replace", &addr, "dev", &self.name])
                .await?;
        }

        let updown = if self.config.enabled { "up" } else { "down" };
        self.ctx
            .ip(&["link", "set", "dev", &self.name, updown])
            .await?;
        Ok(())
    }

    async fn flush(&mut self) {
        tracing::info!(interface = %self.name, "Flushing interface");
        remove_routes(&self.ctx, self.routes(), &self.name).await;

        if self.master.is_some() {
            self.ctx
                .ip_best_effort(&["link", "set", "dev", &self.name, "nomaster"])
                .await
                .log("bridge detach");
        }

        self.ctx
            .ip_best_effort(&["addr", "flush", "dev", &self.name])
            .await
            .log("address flush");

        if self.owns_link() {
            self.ctx
                .ip_best_effort(&["link", "del", "dev", &self.name])
                .await
                .log("link delete");
        } else {
            self.ctx
                .ip_best_effort(&["link", "set", "dev", &self.name, "down"])
                .await
                .log("link down");
        }
    }
}
