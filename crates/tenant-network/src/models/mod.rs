//! Data models for tenant networks

mod network;

pub use network::{
    gateway_for, host_at, DhcpRange, IpAllocation, MacAddress, NetworkState, StaticIpAssignment,
    TenantNetwork, DHCP_END_OFFSET, DHCP_START_OFFSET, FIRST_STATIC_OFFSET, GATEWAY_OFFSET,
    LAST_STATIC_OFFSET,
};
