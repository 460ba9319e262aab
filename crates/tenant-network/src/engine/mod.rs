//! Reconciliation engine
//!
//! Orchestrates the registry, the allocators and the control plane into the
//! two VM-lifecycle entry points, [`ReconciliationEngine::assign_static_ip`]
//! and [`ReconciliationEngine::release_static_ip`].
//!
//! An assignment moves through
//!
//! ```text
//! RequestReceived → NetworkEnsured → AllocationReserved → ReservationSynced
//! ```
//!
//! The allocation is persisted before the DHCP reservation is touched, so a
//! failure at any later point leaves a record that the next call for the same
//! VM only has to re-sync. Control plane calls are never retried here; the
//! caller repeats the whole operation.

use crate::allocator::{AddressAllocator, Assignment, SubnetAllocator};
use crate::config::EngineConfig;
use crate::control_plane::{self, ControlPlane, DhcpHost, NetworkDefinition};
use crate::events::{EventEnvelope, EventPublisher, NetworkEvent};
use crate::models::{IpAllocation, StaticIpAssignment, TenantNetwork};
use crate::registry::{NetworkRegistry, NetworkStore, TenantLock};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Progress of one assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    RequestReceived,
    NetworkEnsured,
    AllocationReserved,
    ReservationSynced,
}

impl std::fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileState::RequestReceived => write!(f, "request_received"),
            ReconcileState::NetworkEnsured => write!(f, "network_ensured"),
            ReconcileState::AllocationReserved => write!(f, "allocation_reserved"),
            ReconcileState::ReservationSynced => write!(f, "reservation_synced"),
        }
    }
}

/// A reservation that could not be synced during [`ReconciliationEngine::reconcile_tenant`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub vm_name: String,
    pub error: String,
}

/// Outcome of [`ReconciliationEngine::reconcile_tenant`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub tenant_id: String,
    pub network_name: String,
    /// Whether the network had to be restarted or finish provisioning
    pub healed: bool,
    /// VMs whose reservation now matches their allocation
    pub synced: Vec<String>,
    pub failed: Vec<SyncFailure>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tenant network allocation engine
pub struct ReconciliationEngine {
    registry: NetworkRegistry,
    control_plane: Arc<dyn ControlPlane>,
    addresses: AddressAllocator,
    events: EventPublisher,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn NetworkStore>,
        subnets: SubnetAllocator,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            registry: NetworkRegistry::new(store, subnets),
            control_plane,
            addresses: AddressAllocator::new(),
            events: EventPublisher::default(),
        }
    }

    /// Build the engine from validated configuration
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = NetworkRegistry::open_store(&config.store).await?;
        let subnets = SubnetAllocator::from_config(&config.pool)?;
        let control_plane = control_plane::build(&config.control_plane);

        info!(
            pool = %subnets.base_network(),
            capacity = subnets.capacity(),
            backend = %control_plane.backend_type(),
            "Tenant network engine ready"
        );
        Ok(Self::new(store, subnets, control_plane))
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Give `vm_name` a static address in its tenant's network
    ///
    /// Provisions the tenant network on first use. Repeated calls for the same
    /// VM return the same address and MAC and re-sync the DHCP reservation.
    #[instrument(skip(self))]
    pub async fn assign_static_ip(
        &self,
        tenant_id: &str,
        vm_name: &str,
    ) -> Result<StaticIpAssignment> {
        validate_identifier("tenant_id", tenant_id)?;
        validate_identifier("vm_name", vm_name)?;

        let mut state = ReconcileState::RequestReceived;
        let result = self.assign(tenant_id, vm_name, &mut state).await;
        if let Err(e) = &result {
            warn!(
                state = %state,
                kind = %e.kind(),
                error = %e,
                "Static IP assignment failed"
            );
        }
        result
    }

    async fn assign(
        &self,
        tenant_id: &str,
        vm_name: &str,
        state: &mut ReconcileState,
    ) -> Result<StaticIpAssignment> {
        let lock = self.registry.lock(tenant_id).await;

        let network = self.ensure_network(&lock).await?;
        *state = ReconcileState::NetworkEnsured;

        let (network, allocation) = match self.addresses.assign(&network, vm_name)? {
            Assignment::Existing(allocation) => {
                debug!(ip = %allocation.ip_address, "Reusing existing allocation");
                (network, allocation)
            }
            Assignment::Fresh(allocation) => {
                let network = self
                    .registry
                    .add_allocation(&lock, allocation.clone())
                    .await?;
                info!(
                    network = %network.network_name,
                    ip = %allocation.ip_address,
                    mac = %allocation.mac_address,
                    "Allocation created"
                );
                self.events.publish(NetworkEvent::AllocationCreated {
                    tenant_id: tenant_id.to_string(),
                    vm_name: vm_name.to_string(),
                    ip: allocation.ip_address,
                    mac: allocation.mac_address,
                });
                (network, allocation)
            }
        };
        *state = ReconcileState::AllocationReserved;

        if let Err(e) = self
            .upsert_dhcp_host(&network.network_name, &allocation)
            .await
        {
            self.events.publish(NetworkEvent::ReservationSyncFailed {
                tenant_id: tenant_id.to_string(),
                vm_name: vm_name.to_string(),
                error: e.to_string(),
            });
            return Err(e);
        }
        *state = ReconcileState::ReservationSynced;

        self.events.publish(NetworkEvent::ReservationSynced {
            tenant_id: tenant_id.to_string(),
            network_name: network.network_name.clone(),
            vm_name: vm_name.to_string(),
            ip: allocation.ip_address,
        });
        Ok(StaticIpAssignment::new(&network, &allocation))
    }

    /// Drop the VM's static address and its DHCP reservation
    ///
    /// Releasing a VM that has no allocation succeeds. Failing to delete the
    /// reservation is logged only; the address is already free and the next
    /// upsert on it replaces the stale entry.
    #[instrument(skip(self))]
    pub async fn release_static_ip(&self, tenant_id: &str, vm_name: &str) -> Result<()> {
        validate_identifier("tenant_id", tenant_id)?;
        validate_identifier("vm_name", vm_name)?;

        let lock = self.registry.lock(tenant_id).await;
        let Some(released) = self.registry.remove_allocation(&lock, vm_name).await? else {
            debug!("No allocation to release");
            return Ok(());
        };
        let allocation = released.allocation;
        info!(
            network = %released.network_name,
            ip = %allocation.ip_address,
            "Allocation released"
        );

        let host = DhcpHost::from(&allocation);
        let reservation_removed = match self
            .control_plane
            .delete_dhcp_host(&released.network_name, &host)
            .await
        {
            Ok(removed) => {
                if !removed {
                    debug!(network = %released.network_name, "No DHCP host entry to remove");
                }
                removed
            }
            Err(e) => {
                warn!(
                    network = %released.network_name,
                    ip = %allocation.ip_address,
                    error = %e,
                    "Failed to remove DHCP host entry, leaving it for the next upsert"
                );
                false
            }
        };

        self.events.publish(NetworkEvent::AllocationReleased {
            tenant_id: tenant_id.to_string(),
            vm_name: vm_name.to_string(),
            ip: allocation.ip_address,
            reservation_removed,
        });
        Ok(())
    }

    /// Bring a tenant's control plane state back in line with its record
    ///
    /// Finishes provisioning a network left half-built, restarts it if it is
    /// down, and re-upserts every reservation. Individual reservation
    /// failures are reported, not raised.
    #[instrument(skip(self))]
    pub async fn reconcile_tenant(&self, tenant_id: &str) -> Result<ReconcileReport> {
        validate_identifier("tenant_id", tenant_id)?;

        let lock = self.registry.lock(tenant_id).await;
        let recorded = self
            .registry
            .get(tenant_id)
            .await?
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))?;

        let (network, healed) = if recorded.is_ready() {
            let healed = self.ensure_live(&recorded).await?;
            (recorded, healed)
        } else {
            (self.ensure_network(&lock).await?, true)
        };

        let mut report = ReconcileReport {
            tenant_id: tenant_id.to_string(),
            network_name: network.network_name.clone(),
            healed,
            synced: Vec::new(),
            failed: Vec::new(),
        };
        for allocation in &network.allocations {
            match self
                .upsert_dhcp_host(&network.network_name, allocation)
                .await
            {
                Ok(()) => report.synced.push(allocation.vm_name.clone()),
                Err(e) => {
                    warn!(vm_name = %allocation.vm_name, error = %e, "Reservation sync failed");
                    self.events.publish(NetworkEvent::ReservationSyncFailed {
                        tenant_id: tenant_id.to_string(),
                        vm_name: allocation.vm_name.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push(SyncFailure {
                        vm_name: allocation.vm_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            network = %report.network_name,
            healed,
            synced = report.synced.len(),
            failed = report.failed.len(),
            "Tenant reconciled"
        );
        Ok(report)
    }

    /// The tenant's recorded network
    pub async fn tenant_network(&self, tenant_id: &str) -> Result<TenantNetwork> {
        self.registry
            .get(tenant_id)
            .await?
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))
    }

    /// The VM's recorded allocation, without touching the control plane
    pub async fn allocation(&self, tenant_id: &str, vm_name: &str) -> Result<IpAllocation> {
        self.registry
            .find_allocation(tenant_id, vm_name)
            .await?
            .ok_or_else(|| Error::AllocationNotFound {
                tenant_id: tenant_id.to_string(),
                vm_name: vm_name.to_string(),
            })
    }

    /// Every recorded tenant network
    pub async fn networks(&self) -> Result<Vec<TenantNetwork>> {
        self.registry.list().await
    }

    /// Get or provision the tenant network and make sure it is live
    async fn ensure_network(&self, lock: &TenantLock) -> Result<TenantNetwork> {
        let ensured = self
            .registry
            .get_or_create(lock, self.control_plane.as_ref())
            .await?;

        if ensured.created {
            self.events.publish(NetworkEvent::NetworkProvisioned {
                tenant_id: lock.tenant_id().to_string(),
                network_name: ensured.network.network_name.clone(),
                subnet: ensured.network.subnet_cidr,
            });
        } else {
            self.ensure_live(&ensured.network).await?;
        }
        Ok(ensured.network)
    }

    /// Check liveness, restarting the network once if it is down
    ///
    /// Returns whether a restart was needed.
    async fn ensure_live(&self, network: &TenantNetwork) -> Result<bool> {
        let name = network.network_name.as_str();
        if self.control_plane.is_live(name).await? {
            return Ok(false);
        }

        warn!(network = name, "Recorded network is not live, restarting it");
        let definition = NetworkDefinition::from(network);
        self.control_plane.define_network(&definition).await?;
        self.control_plane.start_network(name).await?;
        self.control_plane.autostart_network(name).await?;

        if !self.control_plane.is_live(name).await? {
            return Err(Error::NetworkNotLive(name.to_string()));
        }

        info!(network = name, "Network restarted");
        self.events.publish(NetworkEvent::NetworkHealed {
            tenant_id: network.tenant_id.clone(),
            network_name: network.network_name.clone(),
        });
        Ok(true)
    }

    /// Replace whatever DHCP host entry overlaps the allocation with one matching it
    async fn upsert_dhcp_host(&self, network_name: &str, allocation: &IpAllocation) -> Result<()> {
        let host = DhcpHost::from(allocation);
        if self
            .control_plane
            .delete_dhcp_host(network_name, &host)
            .await?
        {
            debug!(network = network_name, ip = %host.ip, "Removed previous DHCP host entry");
        }
        self.control_plane.add_dhcp_host(network_name, &host).await
    }
}

/// Reject identifiers that cannot be keys or DHCP host names
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{} must not be empty", field)));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::InvalidArgument(format!(
            "{} must not contain control characters",
            field
        )));
    }
    Ok(())
}
