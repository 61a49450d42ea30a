//! Desired network configuration model
//!
//! A `NetworkConfiguration` is the JSON document submitted by callers:
//! a mapping from logical interface name to `InterfaceConfig`.
//! Structural validation lives here; dependency ordering lives in
//! `manager::plan`.

use crate::error::ErrorDescriptor;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

/// Linux IFNAMSIZ minus the trailing NUL
pub const MAX_IFNAME_LEN: usize = 15;

/// Whole-system desired state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkConfiguration {
    pub interfaces: BTreeMap<String, InterfaceConfig>,
}

impl NetworkConfiguration {
    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Get an interface definition by name
    pub fn get(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.get(name)
    }

    /// Bridge that lists `name` as a member, if any
    pub fn master_of(&self, name: &str) -> Option<&str> {
        self.interfaces.iter().find_map(|(bridge, intf)| match &intf.kind {
            KindConfig::Bridge(b) if b.members.iter().any(|m| m == name) => Some(bridge.as_str()),
            _ => None,
        })
    }

    /// Interfaces that must be brought up before `name`
    ///
    /// Explicit `dependsOn`, a VLAN's parent, and the bridge the
    /// interface is enslaved to.
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let Some(intf) = self.interfaces.get(name) else {
            return Vec::new();
        };

        let mut deps: Vec<String> = intf.depends_on.clone();
        if let KindConfig::Vlan(vlan) = &intf.kind
            && let Some(parent) = &vlan.parent
        {
            deps.push(parent.clone());
        }
        if let Some(master) = self.master_of(name) {
            deps.push(master.to_string());
        }
        deps.sort();
        deps.dedup();
        deps
    }

    /// Structural validation of every interface and cross reference
    ///
    /// Cycle detection needs the dependency graph and is done by the caller.
    pub fn validate(&self) -> Vec<ErrorDescriptor> {
        let mut errors = Vec::new();

        for (name, intf) in &self.interfaces {
            validate_name(name, &mut errors);
            intf.validate(name, &mut errors);

            for dep in &intf.depends_on {
                if dep == name {
                    errors.push(ErrorDescriptor::new(
                        name,
                        Some("dependsOn".into()),
                        format!("Interface '{}' depends on itself", name),
                    ));
                } else if !self.interfaces.contains_key(dep) {
                    errors.push(ErrorDescriptor::new(
                        name,
                        Some("dependsOn".into()),
                        format!("Unknown dependency '{}' - interface not defined", dep),
                    ));
                }
            }

            match &intf.kind {
                KindConfig::Vlan(vlan) => {
                    if let Some(parent) = &vlan.parent
                        && !self.interfaces.contains_key(parent)
                    {
                        errors.push(ErrorDescriptor::new(
                            name,
                            Some("parent".into()),
                            format!("Unknown parent interface '{}'", parent),
                        ));
                    }
                }
                KindConfig::Bridge(bridge) => {
                    for member in &bridge.members {
                        match self.interfaces.get(member) {
                            None => errors.push(ErrorDescriptor::new(
                                name,
                                Some("members".into()),
                                format!("Unknown bridge member '{}'", member),
                            )),
                            Some(m) if matches!(m.kind, KindConfig::Bridge(_)) || member == name => {
                                errors.push(ErrorDescriptor::new(
                                    name,
                                    Some("members".into()),
                                    format!("Bridge member '{}' cannot be a bridge", member),
                                ))
                            }
                            Some(_) => {}
                        }
                    }
                }
                _ => {}
            }
        }

        // Tunnels sharing an accept rule would close it for each other
        let mut ports: HashMap<u16, &str> = HashMap::new();
        for (name, intf) in &self.interfaces {
            let KindConfig::Wireguard(wg) = &intf.kind else {
                continue;
            };
            if !intf.enabled || wg.listen_port.is_none() {
                continue;
            }
            if let Some(port) = wg.firewall_port()
                && let Some(previous) = ports.insert(port, name)
            {
                let field = if wg.firewall_port.is_some() { "firewallPort" } else { "listenPort" };
                errors.push(ErrorDescriptor::new(
                    name,
                    Some(field.into()),
                    format!("Firewall port {} is already used by interface '{}'", port, previous),
                ));
            }
        }

        // A link can only have one master
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for (name, intf) in &self.interfaces {
            if let KindConfig::Bridge(bridge) = &intf.kind {
                for member in &bridge.members {
                    if let Some(previous) = owners.insert(member, name)
                        && previous != name
                    {
                        errors.push(ErrorDescriptor::new(
                            member,
                            Some("members".into()),
                            format!(
                                "Interface '{}' is a member of both '{}' and '{}'",
                                member, previous, name
                            ),
                        ));
                    }
                }
            }
        }

        errors
    }
}

/// Role an interface plays for routing table membership
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Lan,
    Wan,
    #[default]
    None,
}

/// Per-interface desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    /// Kind tag plus kind-specific fields
    #[serde(flatten)]
    pub kind: KindConfig,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub role: Role,

    /// Interfaces that must be applied before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// IPv4 addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,

    /// IPv6 addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,

    /// IPv4 next hop for the WAN default table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    /// IPv6 next hop for the WAN default table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl InterfaceConfig {
    /// Create an enabled interface of the given kind with defaults elsewhere
    #[cfg(test)]
    pub fn new(kind: KindConfig) -> Self {
        Self {
            kind,
            enabled: true,
            role: Role::None,
            depends_on: Vec::new(),
            ipv4: Vec::new(),
            ipv6: Vec::new(),
            gateway: None,
            gateway6: None,
            mtu: None,
        }
    }

    #[cfg(test)]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Kind discriminant
    pub fn kind(&self) -> InterfaceKind {
        match self.kind {
            KindConfig::Physical => InterfaceKind::Physical,
            KindConfig::Bridge(_) => InterfaceKind::Bridge,
            KindConfig::Vlan(_) => InterfaceKind::Vlan,
            KindConfig::Wireguard(_) => InterfaceKind::Wireguard,
        }
    }

    /// Every configured address, IPv4 first
    pub fn addresses(&self) -> Vec<IpNet> {
        self.ipv4
            .iter()
            .chain(self.ipv6.iter())
            .filter_map(|a| a.parse().ok())
            .collect()
    }

    fn validate(&self, name: &str, errors: &mut Vec<ErrorDescriptor>) {
        for (field, list) in [("ipv4", &self.ipv4), ("ipv6", &self.ipv6)] {
            for addr in list {
                match addr.parse::<IpNet>() {
                    Ok(IpNet::V4(_)) if field == "ipv6" => errors.push(ErrorDescriptor::new(
                        name,
                        Some(field.into()),
                        format!("'{}' is not an IPv6 address", addr),
                    )),
                    Ok(IpNet::V6(_)) if field == "ipv4" => errors.push(ErrorDescriptor::new(
                        name,
                        Some(field.into()),
                        format!("'{}' is not an IPv4 address", addr),
                    )),
                    Ok(_) => {}
                    Err(_) => errors.push(ErrorDescriptor::new(
                        name,
                        Some(field.into()),
                        format!("'{}' is not a valid CIDR address", addr),
                    )),
                }
            }
        }

        if let Some(gw) = self.gateway
            && !gw.is_ipv4()
        {
            errors.push(ErrorDescriptor::new(
                name,
                Some("gateway".into()),
                format!("Gateway {} is not an IPv4 address", gw),
            ));
        }
        if let Some(gw) = self.gateway6
            && !gw.is_ipv6()
        {
            errors.push(ErrorDescriptor::new(
                name,
                Some("gateway6".into()),
                format!("Gateway {} is not an IPv6 address", gw),
            ));
        }

        if let Some(mtu) = self.mtu
            && !(68..=65535).contains(&mtu)
        {
            errors.push(ErrorDescriptor::new(
                name,
                Some("mtu".into()),
                format!("MTU {} out of range 68-65535", mtu),
            ));
        }

        match &self.kind {
            KindConfig::Physical | KindConfig::Bridge(_) => {}
            KindConfig::Vlan(vlan) => vlan.validate(name, errors),
            KindConfig::Wireguard(wg) => wg.validate(name, errors),
        }
    }
}

/// Kind discriminant without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterfaceKind {
    Physical,
    Bridge,
    Vlan,
    Wireguard,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceKind::Physical => "physical",
            InterfaceKind::Bridge => "bridge",
            InterfaceKind::Vlan => "vlan",
            InterfaceKind::Wireguard => "wireguard",
        };
        write!(f, "{}", s)
    }
}

/// Kind-specific configuration, tagged by `kind` in JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KindConfig {
    Physical,
    Bridge(BridgeConfig),
    Vlan(VlanConfig),
    Wireguard(WireguardConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interfaces enslaved to this bridge
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanConfig {
    pub parent: Option<String>,
    pub vid: Option<u32>,
}

impl VlanConfig {
    fn validate(&self, name: &str, errors: &mut Vec<ErrorDescriptor>) {
        if self.parent.as_deref().is_none_or(str::is_empty) {
            errors.push(ErrorDescriptor::new(
                name,
                Some("parent".into()),
                "VLAN parent interface is not specified",
            ));
        }
        match self.vid {
            None => errors.push(ErrorDescriptor::new(
                name,
                Some("vid".into()),
                "VLAN id is not specified",
            )),
            Some(vid) if !(1..=4094).contains(&vid) => errors.push(ErrorDescriptor::new(
                name,
                Some("vid".into()),
                format!("VLAN id {} out of range 1-4094", vid),
            )),
            Some(_) => {}
        }
    }
}

/// WireGuard tunnel configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u32>,

    /// Port opened in the firewall instead of `listen_port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_port: Option<u32>,

    /// Run behind the shared isolated namespace
    #[serde(default)]
    pub ns_mode: bool,

    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl WireguardConfig {
    /// Port to open in the firewall: the override if present, else the listen port
    pub fn firewall_port(&self) -> Option<u16> {
        self.firewall_port
            .or(self.listen_port)
            .and_then(|p| u16::try_from(p).ok())
    }

    fn validate(&self, name: &str, errors: &mut Vec<ErrorDescriptor>) {
        if self.private_key.as_deref().is_none_or(str::is_empty) {
            errors.push(ErrorDescriptor::new(
                name,
                Some("privateKey".into()),
                format!("Private key is not specified for Wireguard interface {}", name),
            ));
        }

        for (field, port) in [("listenPort", self.listen_port), ("firewallPort", self.firewall_port)] {
            if let Some(port) = port
                && !(1..=65535).contains(&port)
            {
                errors.push(ErrorDescriptor::new(
                    name,
                    Some(field.into()),
                    format!("{} {} is not a valid UDP port", field, port),
                ));
            }
        }

        for (idx, peer) in self.peers.iter().enumerate() {
            peer.validate(name, idx, errors);
        }
    }
}

/// A WireGuard peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(rename = "allowedIPs", default)]
    pub allowed_ips: Vec<String>,

    /// Keepalive interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u32>,
}

impl Peer {
    /// Allowed ranges that parse as CIDR literals
    pub fn allowed_nets(&self) -> impl Iterator<Item = IpNet> + '_ {
        self.allowed_ips.iter().filter_map(|a| a.parse().ok())
    }

    fn validate(&self, name: &str, idx: usize, errors: &mut Vec<ErrorDescriptor>) {
        if self.public_key.as_deref().is_none_or(str::is_empty) {
            errors.push(ErrorDescriptor::new(
                name,
                Some(format!("peers[{}].publicKey", idx)),
                format!("publicKey of peer {} in Wireguard interface {} is not specified", idx, name),
            ));
        }

        for allowed in &self.allowed_ips {
            if allowed.parse::<IpNet>().is_err() {
                errors.push(ErrorDescriptor::new(
                    name,
                    Some(format!("peers[{}].allowedIPs", idx)),
                    format!("'{}' is not a valid IPv4 or IPv6 CIDR", allowed),
                ));
            }
        }
    }
}

fn validate_name(name: &str, errors: &mut Vec<ErrorDescriptor>) {
    if name.is_empty() {
        errors.push(ErrorDescriptor::new(name, None, "Interface name is empty"));
    } else if name.len() > MAX_IFNAME_LEN {
        errors.push(ErrorDescriptor::new(
            name,
            None,
            format!("Interface name longer than {} characters", MAX_IFNAME_LEN),
        ));
    } else if name.contains('/') || name.chars().any(char::is_whitespace) || name == "." || name == ".." {
        errors.push(ErrorDescriptor::new(name, None, "Interface name contains invalid characters"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wg0() -> NetworkConfiguration {
        NetworkConfiguration::from_json(
            r#"{
                "wg0": {
                    "kind": "wireguard",
                    "enabled": true,
                    "role": "lan",
                    "listenPort": 51820,
                    "privateKey": "k1",
                    "peers": [{"publicKey": "p1", "allowedIPs": ["10.0.5.0/24"]}]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_wireguard() {
        let config = wg0();
        let intf = config.get("wg0").unwrap();
        assert_eq!(intf.kind(), InterfaceKind::Wireguard);
        assert_eq!(intf.role, Role::Lan);
        let KindConfig::Wireguard(wg) = &intf.kind else {
            panic!("expected wireguard");
        };
        assert_eq!(wg.listen_port, Some(51820));
        assert_eq!(wg.peers[0].allowed_ips, vec!["10.0.5.0/24"]);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_missing_public_key() {
        let config = NetworkConfiguration::from_json(
            r#"{"wg0": {"kind": "wireguard", "privateKey": "k1",
                "peers": [{"publicKey": "p1"}, {"allowedIPs": ["10.0.6.0/24"]}]}}"#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field.as_deref(), Some("peers[1].publicKey"));
    }

    #[test]
    fn test_invalid_port_and_cidr() {
        let config = NetworkConfiguration::from_json(
            r#"{"wg0": {"kind": "wireguard", "privateKey": "k1", "listenPort": 70000,
                "peers": [{"publicKey": "p1", "allowedIPs": ["10.0.5.0/33", "fd00::/64"]}]}}"#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field.as_deref() == Some("listenPort")));
        assert!(errors.iter().any(|e| e.message.contains("10.0.5.0/33")));
    }

    #[test]
    fn test_firewall_port_override() {
        let mut wg = WireguardConfig {
            listen_port: Some(51820),
            ..Default::default()
        };
        assert_eq!(wg.firewall_port(), Some(51820));
        wg.firewall_port = Some(443);
        assert_eq!(wg.firewall_port(), Some(443));
        wg.listen_port = None;
        assert_eq!(wg.firewall_port(), Some(443));
    }

    #[test]
    fn test_dependencies() {
        let config = NetworkConfiguration::from_json(
            r#"{
                "eth0": {"kind": "physical"},
                "eth1": {"kind": "physical"},
                "br0": {"kind": "bridge", "members": ["eth1"]},
                "eth0.10": {"kind": "vlan", "parent": "eth0", "vid": 10},
                "wg0": {"kind": "wireguard", "privateKey": "k", "dependsOn": ["br0"]}
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_empty());
        assert_eq!(config.master_of("eth1"), Some("br0"));
        assert_eq!(config.dependencies_of("eth1"), vec!["br0"]);
        assert_eq!(config.dependencies_of("eth0.10"), vec!["eth0"]);
        assert_eq!(config.dependencies_of("wg0"), vec!["br0"]);
        assert!(config.dependencies_of("eth0").is_empty());
    }

    #[test]
    fn test_unknown_references() {
        let config = NetworkConfiguration::from_json(
            r#"{
                "br0": {"kind": "bridge", "members": ["eth9"]},
                "vlan5": {"kind": "vlan", "parent": "eth8", "vid": 5000},
                "wg0": {"kind": "wireguard", "privateKey": "k", "dependsOn": ["wg0", "nope"]}
            }"#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_member_of_two_bridges() {
        let config = NetworkConfiguration::from_json(
            r#"{
                "eth1": {"kind": "physical"},
                "br0": {"kind": "bridge", "members": ["eth1"]},
                "br1": {"kind": "bridge", "members": ["eth1"]}
            }"#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].interface.as_deref(), Some("eth1"));
    }

    #[test]
    fn test_shared_firewall_port_rejected() {
        let config = NetworkConfiguration::from_json(
            r#"{
                "wg0": {"kind": "wireguard", "privateKey": "k", "listenPort": 51820},
                "wg1": {"kind": "wireguard", "privateKey": "k", "listenPort": 51821, "firewallPort": 51820}
            }"#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].interface.as_deref(), Some("wg1"));
        assert_eq!(errors[0].field.as_deref(), Some("firewallPort"));
        assert!(errors[0].message.contains("'wg0'"));

        // A disabled tunnel never opens its port
        let config = NetworkConfiguration::from_json(
            r#"{
                "wg0": {"kind": "wireguard", "privateKey": "k", "listenPort": 51820},
                "wg1": {"kind": "wireguard", "privateKey": "k", "enabled": false, "listenPort": 51820}
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_name_too_long() {
        let mut config = NetworkConfiguration::default();
        config
            .interfaces
            .insert("averyveryverylongname".into(), InterfaceConfig::new(KindConfig::Physical));
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn test_serialize_roundtrip_shape() {
        let config = wg0();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["wg0"]["kind"], "wireguard");
        assert_eq!(json["wg0"]["peers"][0]["allowedIPs"][0], "10.0.5.0/24");
        let back: NetworkConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
