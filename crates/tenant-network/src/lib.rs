//! Tenant Network Allocation Engine
//!
//! Gives every tenant an isolated /24 on the hypervisor's virtual network
//! manager and every VM of that tenant a static address with a deterministic
//! MAC, keeping the control plane's DHCP reservations in line with the
//! durable allocation state:
//! - First-fit /24 selection from a configured pool
//! - Per-tenant serialization of allocation, with no cross-tenant blocking
//! - Allocation persisted before any DHCP sync, so retries only re-sync
//! - Idempotent network definition and delete-then-add DHCP upserts
//! - Timeout-bounded control plane calls (libvirt `virsh` or in-memory)

pub mod allocator;
pub mod config;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod registry;

// Re-export core types
pub use allocator::{derive_mac, AddressAllocator, Assignment, SubnetAllocator, MAC_OUI};
pub use config::{ControlPlaneConfig, EngineConfig, PoolConfig, StoreBackend, StoreConfig};
pub use control_plane::{
    BackendType, ControlPlane, DefineOutcome, DhcpHost, MemoryControlPlane, NetworkDefinition,
    TimeoutControlPlane, VirshControlPlane,
};
pub use engine::{ReconcileReport, ReconcileState, ReconciliationEngine, SyncFailure};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventEnvelope, EventPublisher, NetworkEvent};
pub use models::{
    DhcpRange, IpAllocation, MacAddress, NetworkState, StaticIpAssignment, TenantNetwork,
};
pub use registry::{
    EnsuredNetwork, JsonFileStore, MemoryStore, NetworkRegistry, NetworkStore, ReleasedAllocation,
    TenantLock,
};
