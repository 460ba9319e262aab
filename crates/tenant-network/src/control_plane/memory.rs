//! In-memory control plane backend
//!
//! Keeps network definitions and DHCP host tables in process memory with the
//! same matching rules libvirt applies to `ip-dhcp-host` entries. Supports
//! fault and latency injection plus a call journal, which is what the engine
//! tests drive crash and timeout scenarios through.

use super::traits::{BackendType, ControlPlane, DefineOutcome, DhcpHost, NetworkDefinition};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Control plane operations, for fault injection and journaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Define,
    Start,
    Autostart,
    IsLive,
    AddHost,
    DeleteHost,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Define => "define_network",
            Operation::Start => "start_network",
            Operation::Autostart => "autostart_network",
            Operation::IsLive => "is_live",
            Operation::AddHost => "add_dhcp_host",
            Operation::DeleteHost => "delete_dhcp_host",
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryNetwork {
    definition: NetworkDefinition,
    active: bool,
    autostart: bool,
    // Start reports success but the network stays down
    stuck: bool,
    hosts: Vec<DhcpHost>,
}

#[derive(Debug, Default)]
struct Faults {
    failures: HashMap<Operation, u32>,
    latency: HashMap<Operation, Duration>,
}

/// In-memory control plane
#[derive(Debug, Default)]
pub struct MemoryControlPlane {
    networks: Mutex<HashMap<String, MemoryNetwork>>,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<(Operation, String)>>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: Operation, times: u32) {
        self.faults.lock().failures.insert(operation, times);
    }

    /// Delay every call of `operation`
    pub fn set_latency(&self, operation: Operation, latency: Duration) {
        self.faults.lock().latency.insert(operation, latency);
    }

    /// Drop all injected faults and latencies
    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.failures.clear();
        faults.latency.clear();
    }

    /// Simulate the network going down (host reboot without autostart, manual destroy)
    pub fn stop_network(&self, name: &str) {
        if let Some(network) = self.networks.lock().get_mut(name) {
            network.active = false;
        }
    }

    /// Make starts of the network report success without bringing it up
    pub fn set_stuck(&self, name: &str, stuck: bool) {
        if let Some(network) = self.networks.lock().get_mut(name) {
            network.stuck = stuck;
            if stuck {
                network.active = false;
            }
        }
    }

    /// Simulate the network definition disappearing entirely
    pub fn undefine_network(&self, name: &str) {
        self.networks.lock().remove(name);
    }

    /// Current definition of a network
    pub fn definition(&self, name: &str) -> Option<NetworkDefinition> {
        self.networks
            .lock()
            .get(name)
            .map(|n| n.definition.clone())
    }

    /// Names of all defined networks
    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_autostart(&self, name: &str) -> bool {
        self.networks
            .lock()
            .get(name)
            .map(|n| n.autostart)
            .unwrap_or(false)
    }

    /// DHCP host table of a network
    pub fn hosts(&self, name: &str) -> Vec<DhcpHost> {
        self.networks
            .lock()
            .get(name)
            .map(|n| n.hosts.clone())
            .unwrap_or_default()
    }

    /// Put a host entry in place directly, bypassing the conflict checks
    pub fn insert_host(&self, name: &str, host: DhcpHost) {
        if let Some(network) = self.networks.lock().get_mut(name) {
            network.hosts.push(host);
        }
    }

    /// Operations called so far, in order
    pub fn calls(&self) -> Vec<Operation> {
        self.journal.lock().iter().map(|(op, _)| *op).collect()
    }

    /// Number of calls of one operation so far
    pub fn call_count(&self, operation: Operation) -> usize {
        self.journal
            .lock()
            .iter()
            .filter(|(op, _)| *op == operation)
            .count()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Journal the call, apply latency, then consume an injected failure if one is armed
    async fn enter(&self, operation: Operation, target: &str) -> Result<()> {
        trace!(operation = operation.name(), target, "Memory control plane call");
        self.journal.lock().push((operation, target.to_string()));

        let latency = self.faults.lock().latency.get(&operation).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.failures.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::control_plane(
                    operation.name(),
                    format!("injected failure for {}", target),
                ));
            }
        }
        Ok(())
    }

    fn not_found(operation: Operation, name: &str) -> Error {
        Error::control_plane(operation.name(), format!("network {} not found", name))
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    async fn define_network(&self, definition: &NetworkDefinition) -> Result<DefineOutcome> {
        self.enter(Operation::Define, &definition.name).await?;

        let mut networks = self.networks.lock();
        if let Some(existing) = networks.get(&definition.name) {
            return match definition.mismatch(&existing.definition) {
                None => Ok(DefineOutcome::AlreadyDefined),
                Some(detail) => Err(Error::DefinitionMismatch {
                    name: definition.name.clone(),
                    detail,
                }),
            };
        }

        networks.insert(
            definition.name.clone(),
            MemoryNetwork {
                definition: definition.clone(),
                active: false,
                autostart: false,
                stuck: false,
                hosts: Vec::new(),
            },
        );
        debug!(network = %definition.name, subnet = %definition.subnet, "Defined network");
        Ok(DefineOutcome::Created)
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        self.enter(Operation::Start, name).await?;

        let mut networks = self.networks.lock();
        let network = networks
            .get_mut(name)
            .ok_or_else(|| Self::not_found(Operation::Start, name))?;
        network.active = !network.stuck;
        Ok(())
    }

    async fn autostart_network(&self, name: &str) -> Result<()> {
        self.enter(Operation::Autostart, name).await?;

        let mut networks = self.networks.lock();
        let network = networks
            .get_mut(name)
            .ok_or_else(|| Self::not_found(Operation::Autostart, name))?;
        network.autostart = true;
        Ok(())
    }

    async fn is_live(&self, name: &str) -> Result<bool> {
        self.enter(Operation::IsLive, name).await?;

        Ok(self
            .networks
            .lock()
            .get(name)
            .map(|n| n.active)
            .unwrap_or(false))
    }

    async fn add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<()> {
        self.enter(Operation::AddHost, network).await?;

        let mut networks = self.networks.lock();
        let entry = networks
            .get_mut(network)
            .ok_or_else(|| Self::not_found(Operation::AddHost, network))?;
        if !entry.active {
            return Err(Error::control_plane(
                Operation::AddHost.name(),
                format!("network {} is not active", network),
            ));
        }
        if let Some(clash) = entry.hosts.iter().find(|h| host_matches(h, host)) {
            return Err(Error::control_plane(
                Operation::AddHost.name(),
                format!(
                    "existing dhcp host entry {} {} {} conflicts with {} {} {}",
                    clash.mac, clash.name, clash.ip, host.mac, host.name, host.ip
                ),
            ));
        }
        entry.hosts.push(host.clone());
        Ok(())
    }

    async fn delete_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<bool> {
        self.enter(Operation::DeleteHost, network).await?;

        let mut networks = self.networks.lock();
        let entry = networks
            .get_mut(network)
            .ok_or_else(|| Self::not_found(Operation::DeleteHost, network))?;
        let before = entry.hosts.len();
        entry.hosts.retain(|h| !host_matches(h, host));
        Ok(entry.hosts.len() != before)
    }
}

/// libvirt treats host entries as the same when any of MAC, name or IP match
fn host_matches(a: &DhcpHost, b: &DhcpHost) -> bool {
    a.mac == b.mac || a.name == b.name || a.ip == b.ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MacAddress, TenantNetwork};
    use std::net::Ipv4Addr;

    fn definition() -> NetworkDefinition {
        NetworkDefinition::from(&TenantNetwork::new(
            "userA",
            "10.200.10.0/24".parse().unwrap(),
        ))
    }

    fn host(name: &str, last_octet: u8, mac_tail: u8) -> DhcpHost {
        DhcpHost {
            mac: MacAddress::new([0x52, 0x54, 0x00, 0, 0, mac_tail]),
            name: name.to_string(),
            ip: Ipv4Addr::new(10, 200, 10, last_octet),
        }
    }

    async fn live_network(cp: &MemoryControlPlane) -> NetworkDefinition {
        let def = definition();
        cp.define_network(&def).await.unwrap();
        cp.start_network(&def.name).await.unwrap();
        def
    }

    #[tokio::test]
    async fn test_define_is_idempotent() {
        let cp = MemoryControlPlane::new();
        let def = definition();

        assert_eq!(cp.define_network(&def).await.unwrap(), DefineOutcome::Created);
        assert_eq!(
            cp.define_network(&def).await.unwrap(),
            DefineOutcome::AlreadyDefined
        );

        let mut other = def.clone();
        other.subnet = "10.200.11.0/24".parse().unwrap();
        assert!(matches!(
            cp.define_network(&other).await,
            Err(Error::DefinitionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_and_liveness() {
        let cp = MemoryControlPlane::new();
        let def = definition();

        assert!(!cp.is_live(&def.name).await.unwrap());
        assert!(cp.start_network(&def.name).await.is_err());

        cp.define_network(&def).await.unwrap();
        assert!(!cp.is_live(&def.name).await.unwrap());

        cp.start_network(&def.name).await.unwrap();
        cp.start_network(&def.name).await.unwrap();
        assert!(cp.is_live(&def.name).await.unwrap());

        cp.stop_network(&def.name);
        assert!(!cp.is_live(&def.name).await.unwrap());

        cp.set_stuck(&def.name, true);
        cp.start_network(&def.name).await.unwrap();
        assert!(!cp.is_live(&def.name).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_rejects_conflicting_host() {
        let cp = MemoryControlPlane::new();
        let def = live_network(&cp).await;

        cp.add_dhcp_host(&def.name, &host("vm1", 10, 1)).await.unwrap();
        // same IP, different VM
        assert!(cp.add_dhcp_host(&def.name, &host("vm2", 10, 2)).await.is_err());
        // same VM again
        assert!(cp.add_dhcp_host(&def.name, &host("vm1", 10, 1)).await.is_err());
        assert_eq!(cp.hosts(&def.name).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_matches_any_field() {
        let cp = MemoryControlPlane::new();
        let def = live_network(&cp).await;
        cp.add_dhcp_host(&def.name, &host("vm1", 10, 1)).await.unwrap();

        // Different MAC and name, same IP: still removes the stale entry
        assert!(cp.delete_dhcp_host(&def.name, &host("vm2", 10, 2)).await.unwrap());
        assert!(cp.hosts(&def.name).is_empty());

        // Every entry overlapping the target goes, not just the first
        cp.insert_host(&def.name, host("vm1", 10, 1));
        cp.insert_host(&def.name, host("vm2", 11, 2));
        cp.insert_host(&def.name, host("vm3", 12, 3));
        assert!(cp.delete_dhcp_host(&def.name, &host("vm2", 10, 9)).await.unwrap());
        assert_eq!(cp.hosts(&def.name), vec![host("vm3", 12, 3)]);
        assert!(!cp.delete_dhcp_host(&def.name, &host("vm2", 10, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_requires_active_network() {
        let cp = MemoryControlPlane::new();
        let def = definition();
        cp.define_network(&def).await.unwrap();

        assert!(cp.add_dhcp_host(&def.name, &host("vm1", 10, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cp = MemoryControlPlane::new();
        let def = live_network(&cp).await;
        cp.fail_next(Operation::IsLive, 2);

        assert!(cp.is_live(&def.name).await.is_err());
        assert!(cp.is_live(&def.name).await.is_err());
        assert!(cp.is_live(&def.name).await.unwrap());
        assert_eq!(cp.call_count(Operation::IsLive), 3);
    }

    #[tokio::test]
    async fn test_journal_order() {
        let cp = MemoryControlPlane::new();
        let def = live_network(&cp).await;
        cp.autostart_network(&def.name).await.unwrap();

        assert_eq!(
            cp.calls(),
            vec![Operation::Define, Operation::Start, Operation::Autostart]
        );
        assert!(cp.is_autostart(&def.name));

        cp.clear_journal();
        assert!(cp.calls().is_empty());
    }
}
