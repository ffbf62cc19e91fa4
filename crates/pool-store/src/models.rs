//! Pool rows
//!
//! Plain row structs for every table the allocator works against. Rows carry no
//! connection to storage; they are read out of a transaction, changed, and
//! handed back with `PoolTransaction::update`.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::store_trait::Record;

/// Floating IP identifier
pub type FloatingIpId = u64;
/// Fixed IP identifier
pub type FixedIpId = u64;
/// Network identifier
pub type NetworkId = u64;
/// Volume identifier
pub type VolumeId = u64;

/// Publicly routable address that can follow a fixed IP around
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: FloatingIpId,
    pub address: Ipv4Addr,
    /// Node whose pool this address belongs to
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ip_id: Option<FixedIpId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FloatingIp {
    /// New unallocated floating IP; the id is assigned on insert.
    pub fn new(address: Ipv4Addr, node_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            address,
            node_name: node_name.into(),
            project_id: None,
            fixed_ip_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Address out of a network's private block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub id: FixedIpId,
    pub address: Ipv4Addr,
    pub network_id: NetworkId,
    /// Never handed out by the allocator
    pub reserved: bool,
    pub allocated: bool,
    pub leased: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FixedIp {
    /// New free fixed IP for `network_id`; the id is assigned on insert.
    pub fn new(address: Ipv4Addr, network_id: NetworkId, reserved: bool) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            address,
            network_id,
            reserved,
            allocated: false,
            leased: false,
            instance_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lifecycle state derived from the allocation flags
    pub fn state(&self) -> FixedIpState {
        match (self.allocated, self.leased) {
            (false, false) => FixedIpState::Free,
            (true, false) => FixedIpState::Allocated,
            (true, true) => FixedIpState::Leased,
            // deallocate() clears `allocated` but leaves a lease behind
            (false, true) => FixedIpState::LeasedUnallocated,
        }
    }
}

/// Fixed IP lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixedIpState {
    Free,
    Allocated,
    Leased,
    LeasedUnallocated,
}

/// A project's private network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_private_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_public_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_public_port: Option<u16>,
    /// Host serving this network, set at most once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Network {
    /// New network with only its project set; the id is assigned on insert.
    pub fn new(project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            project_id: project_id.into(),
            cidr: None,
            netmask: None,
            gateway: None,
            broadcast: None,
            vpn_private_ip: None,
            vpn_public_ip: None,
            vpn_public_port: None,
            node_name: None,
            kind: None,
            vlan: None,
            bridge: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields of a network that provisioning may fill in.
///
/// `project_id` and `node_name` are deliberately absent: the first is fixed at
/// creation and the second only moves through host assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_private_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_public_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_public_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

impl NetworkUpdate {
    /// Copy every set field onto `network`
    pub fn apply_to(self, network: &mut Network) {
        if let Some(cidr) = self.cidr {
            network.cidr = Some(cidr);
        }
        if let Some(netmask) = self.netmask {
            network.netmask = Some(netmask);
        }
        if let Some(gateway) = self.gateway {
            network.gateway = Some(gateway);
        }
        if let Some(broadcast) = self.broadcast {
            network.broadcast = Some(broadcast);
        }
        if let Some(vpn_private_ip) = self.vpn_private_ip {
            network.vpn_private_ip = Some(vpn_private_ip);
        }
        if let Some(vpn_public_ip) = self.vpn_public_ip {
            network.vpn_public_ip = Some(vpn_public_ip);
        }
        if let Some(port) = self.vpn_public_port {
            network.vpn_public_port = Some(port);
        }
        if let Some(kind) = self.kind {
            network.kind = Some(kind);
        }
        if let Some(vlan) = self.vlan {
            network.vlan = Some(vlan);
        }
        if let Some(bridge) = self.bridge {
            network.bridge = Some(bridge);
        }
    }
}

/// One network slot of the deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIndex {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<NetworkId>,
}

impl NetworkIndex {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            network_id: None,
        }
    }
}

/// Storage controller attachment point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDevice {
    pub shelf_id: u16,
    pub blade_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<VolumeId>,
}

impl ExportDevice {
    pub fn new(shelf_id: u16, blade_id: u16) -> Self {
        Self {
            shelf_id,
            blade_id,
            volume_id: None,
        }
    }
}

/// Block storage volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub size_gb: u32,
    pub attachment: VolumeAttachment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    /// New detached volume; the id is assigned on insert.
    pub fn new(project_id: Option<String>, size_gb: u32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            project_id,
            size_gb,
            attachment: VolumeAttachment::Detached,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> VolumeStatus {
        self.attachment.status()
    }

    pub fn attach_status(&self) -> AttachStatus {
        self.attachment.attach_status()
    }
}

/// Where a volume is attached.
///
/// `status` and `attach_status` are both derived from this, so the pairs
/// `available`/`detached` and `in-use`/`attached` cannot drift apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attach_status", rename_all = "kebab-case")]
pub enum VolumeAttachment {
    #[default]
    Detached,
    Attached {
        instance_id: String,
        mountpoint: String,
    },
}

impl VolumeAttachment {
    pub fn status(&self) -> VolumeStatus {
        match self {
            Self::Detached => VolumeStatus::Available,
            Self::Attached { .. } => VolumeStatus::InUse,
        }
    }

    pub fn attach_status(&self) -> AttachStatus {
        match self {
            Self::Detached => AttachStatus::Detached,
            Self::Attached { .. } => AttachStatus::Attached,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Detached => None,
            Self::Attached { instance_id, .. } => Some(instance_id),
        }
    }

    pub fn mountpoint(&self) -> Option<&str> {
        match self {
            Self::Detached => None,
            Self::Attached { mountpoint, .. } => Some(mountpoint),
        }
    }
}

/// Volume availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Available,
    InUse,
}

/// Volume attachment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachStatus {
    Attached,
    Detached,
}

impl Record for FloatingIp {
    type Key = FloatingIpId;
    const TABLE: &'static str = "floating_ips";

    fn key(&self) -> Self::Key {
        self.id
    }

    fn assign_key(&mut self, sequence: u64) {
        self.id = sequence;
    }

    fn unique_key(&self) -> Option<String> {
        Some(self.address.to_string())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for FixedIp {
    type Key = FixedIpId;
    const TABLE: &'static str = "fixed_ips";

    fn key(&self) -> Self::Key {
        self.id
    }

    fn assign_key(&mut self, sequence: u64) {
        self.id = sequence;
    }

    fn unique_key(&self) -> Option<String> {
        Some(self.address.to_string())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for Network {
    type Key = NetworkId;
    const TABLE: &'static str = "networks";

    fn key(&self) -> Self::Key {
        self.id
    }

    fn assign_key(&mut self, sequence: u64) {
        self.id = sequence;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for NetworkIndex {
    type Key = u32;
    const TABLE: &'static str = "network_indexes";

    fn key(&self) -> Self::Key {
        self.index
    }
}

impl Record for ExportDevice {
    type Key = (u16, u16);
    const TABLE: &'static str = "export_devices";

    fn key(&self) -> Self::Key {
        (self.shelf_id, self.blade_id)
    }
}

impl Record for Volume {
    type Key = VolumeId;
    const TABLE: &'static str = "volumes";

    fn key(&self) -> Self::Key {
        self.id
    }

    fn assign_key(&mut self, sequence: u64) {
        self.id = sequence;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
