//! Control plane trait definition
//!
//! Defines the operations the engine needs from the hypervisor's virtual
//! network manager. Implementations only translate; ordering, upsert and
//! retry policy live in the engine.

use crate::models::{DhcpRange, IpAllocation, MacAddress, TenantNetwork};
use crate::Result;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Type of control plane backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// libvirt driven through the `virsh` CLI
    Virsh,
    /// In-process state, for tests and dry runs
    Memory,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Virsh => write!(f, "virsh"),
            BackendType::Memory => write!(f, "memory"),
        }
    }
}

/// Everything needed to define a tenant network on the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub name: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub dhcp_range: DhcpRange,
}

impl NetworkDefinition {
    /// Third octet of the subnet, used to derive per-network device names
    pub fn slot(&self) -> u8 {
        self.subnet.network().octets()[2]
    }

    /// Describe the first difference from `other`, if any
    pub fn mismatch(&self, other: &NetworkDefinition) -> Option<String> {
        if self.subnet != other.subnet {
            return Some(format!("subnet {} != {}", other.subnet, self.subnet));
        }
        if self.gateway != other.gateway {
            return Some(format!("gateway {} != {}", other.gateway, self.gateway));
        }
        if self.dhcp_range != other.dhcp_range {
            return Some(format!(
                "dhcp range {}-{} != {}-{}",
                other.dhcp_range.start,
                other.dhcp_range.end,
                self.dhcp_range.start,
                self.dhcp_range.end
            ));
        }
        None
    }
}

impl From<&TenantNetwork> for NetworkDefinition {
    fn from(network: &TenantNetwork) -> Self {
        Self {
            name: network.network_name.clone(),
            subnet: network.subnet_cidr,
            gateway: network.gateway,
            dhcp_range: network.dhcp_range,
        }
    }
}

/// Outcome of an idempotent define
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefineOutcome {
    /// The network did not exist and was defined now
    Created,
    /// An identical definition was already present
    AlreadyDefined,
}

/// A static DHCP host entry (MAC → IP binding)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpHost {
    pub mac: MacAddress,
    pub name: String,
    pub ip: Ipv4Addr,
}

impl From<&IpAllocation> for DhcpHost {
    fn from(allocation: &IpAllocation) -> Self {
        Self {
            mac: allocation.mac_address,
            name: allocation.vm_name.clone(),
            ip: allocation.ip_address,
        }
    }
}

/// Control plane trait
///
/// Every call may fail or hang; callers bound them with a timeout.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Get the backend type
    fn backend_type(&self) -> BackendType;

    /// Define a network
    ///
    /// Succeeds with `AlreadyDefined` when an identical definition exists and
    /// fails with `DefinitionMismatch` when a different one does.
    async fn define_network(&self, definition: &NetworkDefinition) -> Result<DefineOutcome>;

    /// Start a defined network. Starting an active network succeeds.
    async fn start_network(&self, name: &str) -> Result<()>;

    /// Mark a network to start with the host
    async fn autostart_network(&self, name: &str) -> Result<()>;

    /// Whether the network is defined and active
    async fn is_live(&self, name: &str) -> Result<bool>;

    /// Add a static DHCP host entry
    ///
    /// Fails when an entry with the same MAC, name or IP already exists.
    async fn add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<()>;

    /// Delete every static DHCP host entry sharing the MAC, name or IP of `host`
    ///
    /// Returns `false` when no entry matched.
    async fn delete_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<bool>;
}
