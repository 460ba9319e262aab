//! Tenant network and per-VM allocation models

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Host offset of the gateway inside a tenant /24
pub const GATEWAY_OFFSET: u8 = 1;
/// First host offset handed out by the network's DHCP pool
pub const DHCP_START_OFFSET: u8 = 2;
/// Last host offset handed out by the network's DHCP pool
pub const DHCP_END_OFFSET: u8 = 254;
/// First host offset used for static VM reservations
pub const FIRST_STATIC_OFFSET: u8 = 10;
/// Last host offset used for static VM reservations
pub const LAST_STATIC_OFFSET: u8 = 254;

/// Address at `offset` inside `subnet`
pub fn host_at(subnet: Ipv4Net, offset: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + u32::from(offset))
}

/// Gateway address of a tenant subnet (`.1`)
pub fn gateway_for(subnet: Ipv4Net) -> Ipv4Addr {
    host_at(subnet, GATEWAY_OFFSET)
}

/// Inclusive DHCP address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl DhcpRange {
    /// DHCP range of a tenant subnet (`.2` - `.254`)
    pub fn for_subnet(subnet: Ipv4Net) -> Self {
        Self {
            start: host_at(subnet, DHCP_START_OFFSET),
            end: host_at(subnet, DHCP_END_OFFSET),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip >= self.start && ip <= self.end
    }
}

/// 48-bit MAC address, rendered as lowercase colon-separated hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Locally administered bit (second-least-significant bit of the first octet)
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidArgument(format!("MAC address too short: {}", s)))?;
            if part.len() != 2 {
                return Err(Error::InvalidArgument(format!("Invalid MAC address: {}", s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidArgument(format!("Invalid MAC address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidArgument(format!("MAC address too long: {}", s)));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Static IP reservation of one VM inside its tenant's network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllocation {
    /// VM name, unique within the tenant
    pub vm_name: String,
    /// Reserved address, unique within the tenant subnet
    pub ip_address: Ipv4Addr,
    /// Deterministic MAC derived from tenant and VM name
    pub mac_address: MacAddress,
    /// When the reservation was first made
    pub created_at: DateTime<Utc>,
}

/// Provisioning progress of a tenant network
///
/// A record is written in `Provisioning` before the control plane is touched,
/// so its subnet is reserved even if the process dies mid-provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    /// Subnet reserved; define / start / autostart not yet confirmed
    Provisioning,
    /// Defined, started and marked autostart on the control plane
    Ready,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Provisioning => write!(f, "provisioning"),
            NetworkState::Ready => write!(f, "ready"),
        }
    }
}

/// Isolated virtual network owned by one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantNetwork {
    /// Tenant (user account) identifier
    pub tenant_id: String,
    /// Control plane network name, globally unique
    pub network_name: String,
    /// The tenant's /24, globally unique
    pub subnet_cidr: Ipv4Net,
    /// Always `.1` of `subnet_cidr`
    pub gateway: Ipv4Addr,
    /// Always `.2` - `.254` of `subnet_cidr`
    pub dhcp_range: DhcpRange,
    pub state: NetworkState,
    /// Static reservations in creation order
    #[serde(default)]
    pub allocations: Vec<IpAllocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantNetwork {
    /// Build a fresh network record for `tenant_id` on `subnet_cidr`, not yet provisioned
    pub fn new(tenant_id: impl Into<String>, subnet_cidr: Ipv4Net) -> Self {
        let tenant_id = tenant_id.into();
        let now = Utc::now();
        Self {
            network_name: Self::network_name_for(&tenant_id, subnet_cidr),
            gateway: gateway_for(subnet_cidr),
            dhcp_range: DhcpRange::for_subnet(subnet_cidr),
            state: NetworkState::Provisioning,
            tenant_id,
            subnet_cidr,
            allocations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Network name for a tenant on a subnet: `tn-<tenant hash>-<third octet>`
    ///
    /// The octet makes the name unique whenever the subnet is.
    pub fn network_name_for(tenant_id: &str, subnet_cidr: Ipv4Net) -> String {
        let digest = Sha256::digest(tenant_id.as_bytes());
        format!(
            "tn-{}-{}",
            hex::encode(&digest[..4]),
            subnet_cidr.network().octets()[2]
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state == NetworkState::Ready
    }

    /// Third octet of the subnet, the pool slot this tenant occupies
    pub fn subnet_octet(&self) -> u8 {
        self.subnet_cidr.network().octets()[2]
    }

    /// Find the allocation for a VM
    pub fn find_allocation(&self, vm_name: &str) -> Option<&IpAllocation> {
        self.allocations.iter().find(|a| a.vm_name == vm_name)
    }

    /// Addresses currently reserved for VMs
    pub fn used_addresses(&self) -> BTreeSet<Ipv4Addr> {
        self.allocations.iter().map(|a| a.ip_address).collect()
    }

    /// Check derived fields and per-tenant uniqueness
    pub fn validate(&self) -> Result<()> {
        let corrupt = |detail: String| Error::CorruptRecord {
            tenant_id: self.tenant_id.clone(),
            detail,
        };

        if self.subnet_cidr.prefix_len() != 24 {
            return Err(corrupt(format!("subnet {} is not a /24", self.subnet_cidr)));
        }
        if self.gateway != gateway_for(self.subnet_cidr) {
            return Err(corrupt(format!(
                "gateway {} does not match subnet {}",
                self.gateway, self.subnet_cidr
            )));
        }
        if self.dhcp_range != DhcpRange::for_subnet(self.subnet_cidr) {
            return Err(corrupt(format!(
                "dhcp range {}-{} does not match subnet {}",
                self.dhcp_range.start, self.dhcp_range.end, self.subnet_cidr
            )));
        }

        let mut names = BTreeSet::new();
        let mut ips = BTreeSet::new();
        for allocation in &self.allocations {
            if !names.insert(allocation.vm_name.as_str()) {
                return Err(corrupt(format!("duplicate VM {}", allocation.vm_name)));
            }
            if !ips.insert(allocation.ip_address) {
                return Err(corrupt(format!("duplicate IP {}", allocation.ip_address)));
            }
            let ip = allocation.ip_address;
            let offset = ip.octets()[3];
            if !self.subnet_cidr.contains(&ip)
                || !(FIRST_STATIC_OFFSET..=LAST_STATIC_OFFSET).contains(&offset)
            {
                return Err(corrupt(format!(
                    "IP {} outside static range {}-{}",
                    allocation.ip_address,
                    host_at(self.subnet_cidr, FIRST_STATIC_OFFSET),
                    host_at(self.subnet_cidr, LAST_STATIC_OFFSET)
                )));
            }
        }
        if !self.is_ready() && !self.allocations.is_empty() {
            return Err(corrupt(format!(
                "{} allocations on a network still provisioning",
                self.allocations.len()
            )));
        }

        Ok(())
    }
}

/// What a VM-lifecycle caller needs to render the VM's network device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIpAssignment {
    pub network_name: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

impl StaticIpAssignment {
    pub fn new(network: &TenantNetwork, allocation: &IpAllocation) -> Self {
        Self {
            network_name: network.network_name.clone(),
            ip: allocation.ip_address,
            mac: allocation.mac_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Ipv4Net {
        "10.200.10.0/24".parse().unwrap()
    }

    #[test]
    fn test_derived_addresses() {
        let network = TenantNetwork::new("userA", subnet());

        assert_eq!(network.gateway, Ipv4Addr::new(10, 200, 10, 1));
        assert_eq!(network.dhcp_range.start, Ipv4Addr::new(10, 200, 10, 2));
        assert_eq!(network.dhcp_range.end, Ipv4Addr::new(10, 200, 10, 254));
        assert_eq!(network.subnet_octet(), 10);
        assert!(network.allocations.is_empty());
    }

    #[test]
    fn test_network_name() {
        let name = TenantNetwork::network_name_for("userA", subnet());
        assert!(name.starts_with("tn-"));
        assert!(name.ends_with("-10"));
        // tn- + 8 hex + - + octet
        assert_eq!(name.len(), "tn-".len() + 8 + "-10".len());

        // Stable for the same input, distinct for another tenant
        assert_eq!(name, TenantNetwork::network_name_for("userA", subnet()));
        assert_ne!(name, TenantNetwork::network_name_for("userB", subnet()));
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "52:54:00:AB:cd:0f".parse().unwrap();
        assert_eq!(mac.octets(), [0x52, 0x54, 0x00, 0xab, 0xcd, 0x0f]);
        assert_eq!(mac.to_string(), "52:54:00:ab:cd:0f");
        assert!(mac.is_locally_administered());

        assert!("52:54:00:ab:cd".parse::<MacAddress>().is_err());
        assert!("52:54:00:ab:cd:0f:11".parse::<MacAddress>().is_err());
        assert!("52:54:00:zz:cd:0f".parse::<MacAddress>().is_err());
        assert!("525:4:00:ab:cd:0f".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let mac = MacAddress::new([0x52, 0x54, 0x00, 0x01, 0x02, 0x03]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"52:54:00:01:02:03\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_validate_rejects_tampered_gateway() {
        let mut network = TenantNetwork::new("userA", subnet());
        assert!(network.validate().is_ok());

        network.gateway = Ipv4Addr::new(10, 200, 10, 5);
        assert!(matches!(
            network.validate(),
            Err(Error::CorruptRecord { .. })
        ));
    }

    fn ready_network() -> TenantNetwork {
        let mut network = TenantNetwork::new("userA", subnet());
        network.state = NetworkState::Ready;
        network
    }

    fn allocation(vm: &str, last: u8) -> IpAllocation {
        IpAllocation {
            vm_name: vm.to_string(),
            ip_address: Ipv4Addr::new(10, 200, 10, last),
            mac_address: MacAddress::new([0x52, 0x54, 0x00, 0, 0, last]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_rejects_addresses_outside_static_range() {
        for last in [0, 1, 5, 9, 255] {
            let mut network = ready_network();
            network.allocations.push(allocation("vm1", last));
            let err = network.validate().unwrap_err();
            assert!(err.to_string().contains("static range"), "{}", err);
        }

        let mut network = ready_network();
        network.allocations.push(allocation("vm1", 10));
        network.allocations.push(allocation("vm2", 254));
        assert!(network.validate().is_ok());

        // Another tenant's subnet is out of range too
        network.allocations[0].ip_address = Ipv4Addr::new(10, 200, 11, 10);
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_allocations_while_provisioning() {
        let mut network = TenantNetwork::new("userA", subnet());
        assert_eq!(network.state, NetworkState::Provisioning);
        assert!(network.validate().is_ok());

        network.allocations.push(allocation("vm1", 10));
        assert!(matches!(
            network.validate(),
            Err(Error::CorruptRecord { .. })
        ));

        network.state = NetworkState::Ready;
        assert!(network.validate().is_ok());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_value(ready_network()).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(NetworkState::Provisioning.to_string(), "provisioning");
    }

    #[test]
    fn test_validate_rejects_duplicate_ip() {
        let mut network = ready_network();
        let mac = MacAddress::new([0x52, 0x54, 0x00, 0, 0, 1]);
        for vm in ["vm1", "vm2"] {
            network.allocations.push(IpAllocation {
                vm_name: vm.to_string(),
                ip_address: Ipv4Addr::new(10, 200, 10, 10),
                mac_address: mac,
                created_at: Utc::now(),
            });
        }

        let err = network.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate IP"));
    }

    #[test]
    fn test_find_allocation() {
        let mut network = TenantNetwork::new("userA", subnet());
        network.allocations.push(IpAllocation {
            vm_name: "vm1".into(),
            ip_address: Ipv4Addr::new(10, 200, 10, 10),
            mac_address: MacAddress::new([0x52, 0x54, 0x00, 0, 0, 1]),
            created_at: Utc::now(),
        });

        assert!(network.find_allocation("vm1").is_some());
        assert!(network.find_allocation("vm2").is_none());
        assert_eq!(
            network.used_addresses().into_iter().collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 200, 10, 10)]
        );
    }
}
