//! Provisioning configuration
//!
//! Values come from an optional YAML file named by `NETPOOL_CONFIG`, then
//! individual `NETPOOL_*` environment variables override single fields.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PoolError, Result};

/// Environment variable naming the YAML config file
pub const CONFIG_PATH_ENV: &str = "NETPOOL_CONFIG";

/// Highest usable 802.1Q VLAN id
const MAX_VLAN: u32 = 4094;

/// Addresses reserved at the bottom of every block: network, gateway, VPN
pub const BOTTOM_RESERVED: u32 = 3;

/// Network provisioning parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Total network index slots in the deployment
    pub num_networks: u32,
    /// Range that network blocks are carved out of
    pub private_range: Ipv4Net,
    /// Addresses per network block, a power of two
    pub network_size: u32,
    /// VLAN id of the network with index 0
    pub vlan_start: u16,
    /// Public address of the VPN endpoint
    pub vpn_ip: Ipv4Addr,
    /// VPN public port of the network with index 0
    pub vpn_start: u16,
    /// Addresses reserved at the top of each block for VPN clients
    pub cnt_vpn_clients: u32,
    /// Network kind label stored on each network
    pub network_type: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_networks: 1000,
            private_range: Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
            network_size: 256,
            vlan_start: 100,
            vpn_ip: Ipv4Addr::LOCALHOST,
            vpn_start: 1000,
            cnt_vpn_clients: 5,
            network_type: "vlan".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Load from `NETPOOL_CONFIG` (if set) and the environment, then validate
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file; fields it omits keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PoolError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Loaded network configuration from {}", path.display());
        Self::from_yaml(&contents)
    }

    /// Parse YAML; fields it omits keep their defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| PoolError::InvalidConfig(format!("invalid YAML: {}", e)))
    }

    /// Override fields from `NETPOOL_*` variables resolved through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("NETPOOL_NUM_NETWORKS") {
            self.num_networks = parse_var("NETPOOL_NUM_NETWORKS", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_PRIVATE_RANGE") {
            self.private_range = parse_var("NETPOOL_PRIVATE_RANGE", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_NETWORK_SIZE") {
            self.network_size = parse_var("NETPOOL_NETWORK_SIZE", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_VLAN_START") {
            self.vlan_start = parse_var("NETPOOL_VLAN_START", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_VPN_IP") {
            self.vpn_ip = parse_var("NETPOOL_VPN_IP", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_VPN_START") {
            self.vpn_start = parse_var("NETPOOL_VPN_START", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_CNT_VPN_CLIENTS") {
            self.cnt_vpn_clients = parse_var("NETPOOL_CNT_VPN_CLIENTS", &value)?;
        }
        if let Some(value) = lookup("NETPOOL_NETWORK_TYPE") {
            self.network_type = value;
        }
        Ok(())
    }

    /// Reject configurations that would produce overlapping or unusable blocks
    pub fn validate(&self) -> Result<()> {
        if self.num_networks == 0 {
            return Err(PoolError::InvalidConfig(
                "num_networks must be at least 1".to_string(),
            ));
        }
        if !self.network_size.is_power_of_two() {
            return Err(PoolError::InvalidConfig(format!(
                "network_size {} is not a power of two",
                self.network_size
            )));
        }
        let reserved = self.reserved_per_network();
        if u64::from(self.network_size) <= reserved {
            return Err(PoolError::InvalidConfig(format!(
                "network_size {} leaves no allocable addresses after {} reserved",
                self.network_size, reserved
            )));
        }
        let range_size = 1u64 << (32 - u32::from(self.private_range.prefix_len()));
        let needed = u64::from(self.num_networks) * u64::from(self.network_size);
        if needed > range_size {
            return Err(PoolError::InvalidConfig(format!(
                "{} networks of {} addresses do not fit in {}",
                self.num_networks, self.network_size, self.private_range
            )));
        }
        let last_vlan = u32::from(self.vlan_start) + self.num_networks - 1;
        if last_vlan > MAX_VLAN {
            return Err(PoolError::InvalidConfig(format!(
                "VLAN ids {}..={} exceed {}",
                self.vlan_start, last_vlan, MAX_VLAN
            )));
        }
        let last_port = u32::from(self.vpn_start) + self.num_networks - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(PoolError::InvalidConfig(format!(
                "VPN ports {}..={} exceed {}",
                self.vpn_start,
                last_port,
                u16::MAX
            )));
        }
        Ok(())
    }

    /// Addresses per block that are never allocable
    pub fn reserved_per_network(&self) -> u64 {
        u64::from(BOTTOM_RESERVED) + 1 + u64::from(self.cnt_vpn_clients)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PoolError::InvalidConfig(format!("{}={:?}: {}", name, value, e)))
}
