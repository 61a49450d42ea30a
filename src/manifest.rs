//! Settings file parsing for Portolan
//!
//! Parses `portolan.toml` using serde. Every field has a default so a
//! missing file at the default location yields a usable configuration.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/portolan/portolan.toml";

/// Kernel table ids that belong to the kernel itself (unspec, default, main, local)
const RESERVED_TABLE_IDS: &[u32] = &[0, 253, 254, 255];

/// Load settings from a file
pub fn load(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path).map_err(|e| Error::SettingsRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;

    Ok(settings)
}

/// Load settings, falling back to defaults when the default file is absent
///
/// An explicitly requested path that does not exist is still an error.
pub fn load_or_default(path: &Path) -> Result<Settings> {
    if !path.exists() && path == Path::new(DEFAULT_SETTINGS_PATH) {
        tracing::debug!(path = %path.display(), "Settings file absent, using defaults");
        return Ok(Settings::default());
    }
    load(path)
}

/// Root settings structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Global settings
    #[serde(default)]
    pub config: GlobalConfig,

    /// Routing table ids
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Process spawn throttling
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl Settings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        let r = &self.routing;

        if r.lan_routable == r.wan_routable {
            return Err(Error::SettingsValidation(format!(
                "lan_routable and wan_routable share table id {}",
                r.lan_routable
            )));
        }

        for (name, id) in [("lan_routable", r.lan_routable), ("wan_routable", r.wan_routable)] {
            if RESERVED_TABLE_IDS.contains(&id) {
                return Err(Error::SettingsValidation(format!(
                    "{} uses reserved kernel table id {}",
                    name, id
                )));
            }
        }

        if r.default_table_base <= r.lan_routable.max(r.wan_routable) {
            return Err(Error::SettingsValidation(format!(
                "default_table_base {} must be above the fixed table ids",
                r.default_table_base
            )));
        }

        if self.throttle.capacity <= 0.0 || self.throttle.refill_rate <= 0.0 {
            return Err(Error::SettingsValidation(
                "throttle capacity and refill_rate must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Global settings
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Directory holding the persisted active configuration
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory holding generated per-interface artifacts
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// iproute2 table name registry
    #[serde(default = "default_rt_tables")]
    pub rt_tables: PathBuf,

    /// Per-interface step timeout in seconds (0 disables)
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
            rt_tables: default_rt_tables(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl GlobalConfig {
    /// Directory for generated WireGuard configuration files
    pub fn wireguard_dir(&self) -> PathBuf {
        self.config_dir.join("wireguard")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/portolan")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/portolan")
}

fn default_rt_tables() -> PathBuf {
    PathBuf::from("/etc/iproute2/rt_tables")
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_lan_routable() -> u32 {
    1001
}

fn default_wan_routable() -> u32 {
    1002
}

fn default_table_base() -> u32 {
    10000
}

/// Routing table id configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Table reachable from LAN-side traffic
    #[serde(default = "default_lan_routable")]
    pub lan_routable: u32,

    /// Table reachable from WAN-side traffic
    #[serde(default = "default_wan_routable")]
    pub wan_routable: u32,

    /// First id handed out to `<ifname>_default` tables
    #[serde(default = "default_table_base")]
    pub default_table_base: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            lan_routable: default_lan_routable(),
            wan_routable: default_wan_routable(),
            default_table_base: default_table_base(),
        }
    }
}

fn default_throttle_capacity() -> f64 {
    20.0
}

fn default_throttle_refill_rate() -> f64 {
    50.0
}

/// Token bucket limits for external command spawns
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Burst size
    #[serde(default = "default_throttle_capacity")]
    pub capacity: f64,

    /// Tokens per second
    #[serde(default = "default_throttle_refill_rate")]
    pub refill_rate: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: default_throttle_capacity(),
            refill_rate: default_throttle_refill_rate(),
        }
    }
}
