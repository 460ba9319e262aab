//! Per-tenant static address allocator
//!
//! Picks the lowest free host in `.10` - `.254` of a tenant subnet and
//! derives the VM's MAC from `(tenant_id, vm_name)`. Works purely on the
//! network snapshot it is given; persisting the result is the caller's job.

use crate::models::{
    host_at, IpAllocation, MacAddress, TenantNetwork, FIRST_STATIC_OFFSET, LAST_STATIC_OFFSET,
};
use crate::{Error, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};

/// Locally administered OUI used for every derived MAC (QEMU/KVM range)
pub const MAC_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// Deterministic MAC for a VM: `MAC_OUI` + first 3 bytes of
/// SHA-256(`tenant_id` 0x00 `vm_name`)
pub fn derive_mac(tenant_id: &str, vm_name: &str) -> MacAddress {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(vm_name.as_bytes());
    let digest = hasher.finalize();

    MacAddress::new([
        MAC_OUI[0], MAC_OUI[1], MAC_OUI[2], digest[0], digest[1], digest[2],
    ])
}

/// Result of [`AddressAllocator::assign`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The VM already had a reservation; nothing to persist
    Existing(IpAllocation),
    /// A new reservation that must be persisted before it is used
    Fresh(IpAllocation),
}

impl Assignment {
    pub fn allocation(&self) -> &IpAllocation {
        match self {
            Assignment::Existing(a) | Assignment::Fresh(a) => a,
        }
    }

    pub fn into_allocation(self) -> IpAllocation {
        match self {
            Assignment::Existing(a) | Assignment::Fresh(a) => a,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Assignment::Fresh(_))
    }
}

/// First-fit static address allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressAllocator;

impl AddressAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Find or create the reservation for `vm_name` in `network`
    pub fn assign(&self, network: &TenantNetwork, vm_name: &str) -> Result<Assignment> {
        if let Some(existing) = network.find_allocation(vm_name) {
            return Ok(Assignment::Existing(existing.clone()));
        }

        let used = network.used_addresses();
        let ip_address = (FIRST_STATIC_OFFSET..=LAST_STATIC_OFFSET)
            .map(|offset| host_at(network.subnet_cidr, offset))
            .find(|ip| !used.contains(ip))
            .ok_or(Error::NoAddressSpace(network.subnet_cidr))?;

        Ok(Assignment::Fresh(IpAllocation {
            vm_name: vm_name.to_string(),
            ip_address,
            mac_address: derive_mac(&network.tenant_id, vm_name),
            created_at: Utc::now(),
        }))
    }

    /// Number of static addresses still free in `network`
    pub fn available_count(&self, network: &TenantNetwork) -> usize {
        let used = network.used_addresses();
        (FIRST_STATIC_OFFSET..=LAST_STATIC_OFFSET)
            .map(|offset| host_at(network.subnet_cidr, offset))
            .filter(|ip| !used.contains(ip))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn network() -> TenantNetwork {
        TenantNetwork::new("userA", "10.200.10.0/24".parse().unwrap())
    }

    fn commit(network: &mut TenantNetwork, assignment: Assignment) -> IpAllocation {
        let allocation = assignment.into_allocation();
        network.allocations.push(allocation.clone());
        allocation
    }

    #[test]
    fn test_first_address_is_dot_ten() {
        let allocator = AddressAllocator::new();
        let assignment = allocator.assign(&network(), "vm1").unwrap();

        assert!(assignment.is_fresh());
        assert_eq!(
            assignment.allocation().ip_address,
            Ipv4Addr::new(10, 200, 10, 10)
        );
    }

    #[test]
    fn test_sequential_allocation() {
        let allocator = AddressAllocator::new();
        let mut network = network();

        let assignment = allocator.assign(&network, "vm1").unwrap();
        let a = commit(&mut network, assignment);
        let assignment = allocator.assign(&network, "vm2").unwrap();
        let b = commit(&mut network, assignment);
        let assignment = allocator.assign(&network, "vm3").unwrap();
        let c = commit(&mut network, assignment);

        assert_eq!(a.ip_address, Ipv4Addr::new(10, 200, 10, 10));
        assert_eq!(b.ip_address, Ipv4Addr::new(10, 200, 10, 11));
        assert_eq!(c.ip_address, Ipv4Addr::new(10, 200, 10, 12));
    }

    #[test]
    fn test_existing_allocation_is_returned_unchanged() {
        let allocator = AddressAllocator::new();
        let mut network = network();
        let assignment = allocator.assign(&network, "vm1").unwrap();
        let first = commit(&mut network, assignment);

        let again = allocator.assign(&network, "vm1").unwrap();
        assert!(!again.is_fresh());
        assert_eq!(again.into_allocation(), first);
    }

    #[test]
    fn test_released_gap_is_reused() {
        let allocator = AddressAllocator::new();
        let mut network = network();
        let assignment = allocator.assign(&network, "vm1").unwrap();
        commit(&mut network, assignment);
        let assignment = allocator.assign(&network, "vm2").unwrap();
        commit(&mut network, assignment);
        let assignment = allocator.assign(&network, "vm3").unwrap();
        commit(&mut network, assignment);

        network.allocations.retain(|a| a.vm_name != "vm2");

        let vm4 = allocator.assign(&network, "vm4").unwrap().into_allocation();
        assert_eq!(vm4.ip_address, Ipv4Addr::new(10, 200, 10, 11));
    }

    #[test]
    fn test_exhaustion() {
        let allocator = AddressAllocator::new();
        let mut network = network();

        // .10 through .254 = 245 addresses
        for i in 0..245 {
            let assignment = allocator.assign(&network, &format!("vm{}", i)).unwrap();
            commit(&mut network, assignment);
        }
        assert_eq!(allocator.available_count(&network), 0);

        let result = allocator.assign(&network, "one-too-many");
        assert!(matches!(result, Err(Error::NoAddressSpace(_))));

        // Existing VMs still resolve after exhaustion
        assert!(allocator.assign(&network, "vm7").is_ok());
    }

    #[test]
    fn test_mac_is_deterministic() {
        let a = derive_mac("userA", "vm1");
        let b = derive_mac("userA", "vm1");
        assert_eq!(a, b);
        assert_eq!(&a.octets()[..3], &MAC_OUI);
        assert!(a.is_locally_administered());
    }

    #[test]
    fn test_mac_depends_on_both_inputs() {
        assert_ne!(derive_mac("userA", "vm1"), derive_mac("userA", "vm2"));
        assert_ne!(derive_mac("userA", "vm1"), derive_mac("userB", "vm1"));
        // Separator keeps ("ab", "c") and ("a", "bc") apart
        assert_ne!(derive_mac("ab", "c"), derive_mac("a", "bc"));
    }

    #[test]
    fn test_mac_independent_of_allocation_order() {
        let allocator = AddressAllocator::new();
        let mut network = network();
        let assignment = allocator.assign(&network, "vm1").unwrap();
        commit(&mut network, assignment);

        let late = allocator.assign(&network, "vm2").unwrap().into_allocation();
        assert_eq!(late.mac_address, derive_mac("userA", "vm2"));
    }
}
