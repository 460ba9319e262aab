//! Subnet and address allocation
//!
//! Both allocators are pure functions of the state they are handed:
//! - [`SubnetAllocator`] picks a /24 for a new tenant from the pool
//! - [`AddressAllocator`] picks a host address and MAC for a VM inside a tenant /24

mod address_allocator;
mod subnet_allocator;

pub use address_allocator::{derive_mac, AddressAllocator, Assignment, MAC_OUI};
pub use subnet_allocator::{SubnetAllocator, TENANT_PREFIX_LEN};
