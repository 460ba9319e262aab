//! Tenant network registry
//!
//! Owns every [`TenantNetwork`] document. All mutations of a tenant's record
//! require a [`TenantLock`] for that tenant, which serializes get-or-create
//! and the free-address scan-then-append for one tenant while leaving other
//! tenants independent. Picking a subnet for a new tenant takes a short
//! global section that ends with the subnet durably recorded, so no other
//! tenant can pick the same block, whatever happens on the control plane.

mod store;

pub use store::{JsonFileStore, MemoryStore, NetworkStore, StoreData};

use crate::allocator::SubnetAllocator;
use crate::config::{StoreBackend, StoreConfig};
use crate::control_plane::{ControlPlane, DefineOutcome, NetworkDefinition};
use crate::models::{IpAllocation, NetworkState, TenantNetwork};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Exclusive hold on one tenant's record
///
/// Obtained from [`NetworkRegistry::lock`]; released on drop.
pub struct TenantLock {
    tenant_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for TenantLock {
    fn drop(&mut self) {
        // The guard holds a reference to the mutex, so release it first
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or awaits this lock
        self.locks
            .remove_if(&self.tenant_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl TenantLock {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl std::fmt::Debug for TenantLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantLock")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Result of [`NetworkRegistry::get_or_create`]
#[derive(Debug, Clone)]
pub struct EnsuredNetwork {
    pub network: TenantNetwork,
    /// Whether this call provisioned the network
    pub created: bool,
}

/// An allocation removed by [`NetworkRegistry::remove_allocation`]
#[derive(Debug, Clone)]
pub struct ReleasedAllocation {
    pub network_name: String,
    pub allocation: IpAllocation,
}

/// Durable registry of tenant networks
pub struct NetworkRegistry {
    store: Arc<dyn NetworkStore>,
    subnets: SubnetAllocator,
    // Entries live only while a lock is held or awaited
    tenant_locks: Arc<LockMap>,
    subnet_pick: Mutex<()>,
}

impl NetworkRegistry {
    pub fn new(store: Arc<dyn NetworkStore>, subnets: SubnetAllocator) -> Self {
        Self {
            store,
            subnets,
            tenant_locks: Arc::new(DashMap::new()),
            subnet_pick: Mutex::new(()),
        }
    }

    /// Open the configured store
    pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn NetworkStore>> {
        Ok(match config.backend {
            StoreBackend::Json => Arc::new(JsonFileStore::open(&config.path).await?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        })
    }

    pub fn subnet_allocator(&self) -> &SubnetAllocator {
        &self.subnets
    }

    /// Acquire the tenant's lock, waiting for any in-flight operation on it
    pub async fn lock(&self, tenant_id: &str) -> TenantLock {
        let mutex = self
            .tenant_locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        TenantLock {
            tenant_id: tenant_id.to_string(),
            guard: Some(mutex.lock_owned().await),
            locks: Arc::clone(&self.tenant_locks),
        }
    }

    /// Get a tenant's network
    pub async fn get(&self, tenant_id: &str) -> Result<Option<TenantNetwork>> {
        self.store.get(tenant_id).await
    }

    /// List every tenant network
    pub async fn list(&self) -> Result<Vec<TenantNetwork>> {
        self.store.list().await
    }

    /// Return the tenant's network, provisioning it first if it is not ready
    ///
    /// A new tenant's subnet is recorded in the `Provisioning` state before
    /// anything is defined on the control plane, then the network is defined,
    /// started and marked autostart, and the record is flipped to `Ready`. A
    /// record left in `Provisioning` by an earlier failure is resumed on the
    /// same subnet; redefining an identical network counts as success.
    #[instrument(skip(self, lock, control_plane), fields(tenant_id = %lock.tenant_id))]
    pub async fn get_or_create(
        &self,
        lock: &TenantLock,
        control_plane: &dyn ControlPlane,
    ) -> Result<EnsuredNetwork> {
        let network = match self.store.get(&lock.tenant_id).await? {
            Some(network) if network.is_ready() => {
                return Ok(EnsuredNetwork {
                    network,
                    created: false,
                })
            }
            Some(network) => {
                info!(
                    network = %network.network_name,
                    subnet = %network.subnet_cidr,
                    "Resuming interrupted provisioning"
                );
                network
            }
            None => self.reserve_subnet(lock).await?,
        };

        let network = self.provision(network, control_plane).await?;
        Ok(EnsuredNetwork {
            network,
            created: true,
        })
    }

    /// Record a `Provisioning` network on the lowest free subnet
    async fn reserve_subnet(&self, lock: &TenantLock) -> Result<TenantNetwork> {
        let _pick = self.subnet_pick.lock().await;

        let used = self.store.used_subnets().await?;
        let subnet = self.subnets.allocate(&used)?;
        let network = TenantNetwork::new(lock.tenant_id.clone(), subnet);
        self.store.insert(network.clone()).await?;

        debug!(%subnet, network = %network.network_name, "Subnet reserved");
        Ok(network)
    }

    /// Define, start and autostart a reserved network, then mark it ready
    async fn provision(
        &self,
        mut network: TenantNetwork,
        control_plane: &dyn ControlPlane,
    ) -> Result<TenantNetwork> {
        let definition = NetworkDefinition::from(&network);

        match control_plane.define_network(&definition).await? {
            DefineOutcome::Created => debug!(network = %definition.name, "Network defined"),
            DefineOutcome::AlreadyDefined => {
                info!(network = %definition.name, "Network already defined, adopting it")
            }
        }
        control_plane.start_network(&definition.name).await?;
        control_plane.autostart_network(&definition.name).await?;

        network.state = NetworkState::Ready;
        network.updated_at = chrono::Utc::now();
        self.store.update(network.clone()).await?;

        info!(
            network = %network.network_name,
            subnet = %network.subnet_cidr,
            gateway = %network.gateway,
            "Tenant network provisioned"
        );
        Ok(network)
    }

    /// Find a VM's allocation
    pub async fn find_allocation(
        &self,
        tenant_id: &str,
        vm_name: &str,
    ) -> Result<Option<IpAllocation>> {
        Ok(self
            .store
            .get(tenant_id)
            .await?
            .and_then(|n| n.find_allocation(vm_name).cloned()))
    }

    /// Append an allocation to the tenant's record and persist it
    pub async fn add_allocation(
        &self,
        lock: &TenantLock,
        allocation: IpAllocation,
    ) -> Result<TenantNetwork> {
        let mut network = self.require(&lock.tenant_id).await?;

        if !network.is_ready() {
            return Err(Error::NetworkNotLive(network.network_name));
        }
        if network.find_allocation(&allocation.vm_name).is_some() {
            return Err(Error::Internal(format!(
                "VM {} already has an allocation in tenant {}",
                allocation.vm_name, lock.tenant_id
            )));
        }
        if network.used_addresses().contains(&allocation.ip_address) {
            return Err(Error::IpAlreadyAllocated {
                ip: allocation.ip_address,
                network: network.network_name.clone(),
            });
        }

        network.allocations.push(allocation);
        network.updated_at = chrono::Utc::now();
        self.store.update(network.clone()).await?;
        Ok(network)
    }

    /// Remove a VM's allocation and persist the record
    ///
    /// Returns `None` when the tenant or the VM has no allocation.
    pub async fn remove_allocation(
        &self,
        lock: &TenantLock,
        vm_name: &str,
    ) -> Result<Option<ReleasedAllocation>> {
        let Some(mut network) = self.store.get(&lock.tenant_id).await? else {
            return Ok(None);
        };
        let Some(index) = network
            .allocations
            .iter()
            .position(|a| a.vm_name == vm_name)
        else {
            return Ok(None);
        };

        let allocation = network.allocations.remove(index);
        network.updated_at = chrono::Utc::now();
        self.store.update(network.clone()).await?;
        Ok(Some(ReleasedAllocation {
            network_name: network.network_name,
            allocation,
        }))
    }

    async fn require(&self, tenant_id: &str) -> Result<TenantNetwork> {
        self.store
            .get(tenant_id)
            .await?
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))
    }
}
