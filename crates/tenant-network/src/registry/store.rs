//! Durable tenant network storage
//!
//! The store is the single source of truth for tenant → network and
//! VM → address bindings. Uniqueness of tenant, subnet and network name is
//! enforced here, underneath the registry's own locking.

use crate::models::TenantNetwork;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Abstract tenant network storage
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Get a tenant's network
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantNetwork>>;

    /// List every tenant network, ordered by tenant id
    async fn list(&self) -> Result<Vec<TenantNetwork>>;

    /// Insert a new tenant network
    ///
    /// Fails when the tenant, subnet or network name is already recorded.
    async fn insert(&self, network: TenantNetwork) -> Result<()>;

    /// Replace an existing tenant network
    ///
    /// The subnet and network name of a tenant never change.
    async fn update(&self, network: TenantNetwork) -> Result<()>;

    /// Subnets currently recorded
    async fn used_subnets(&self) -> Result<BTreeSet<Ipv4Net>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|n| n.subnet_cidr)
            .collect())
    }
}

/// Persisted store document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    /// Version for migration purposes
    pub version: u32,
    /// Tenant networks by tenant id
    #[serde(default)]
    pub networks: BTreeMap<String, TenantNetwork>,
}

impl StoreData {
    /// Current data format version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            networks: BTreeMap::new(),
        }
    }

    fn check_insert(&self, network: &TenantNetwork) -> Result<()> {
        network.validate()?;
        if self.networks.contains_key(&network.tenant_id) {
            return Err(Error::TenantExists(network.tenant_id.clone()));
        }
        for existing in self.networks.values() {
            if existing.subnet_cidr == network.subnet_cidr {
                return Err(Error::SubnetConflict(network.subnet_cidr));
            }
            if existing.network_name == network.network_name {
                return Err(Error::NetworkNameConflict(network.network_name.clone()));
            }
        }
        Ok(())
    }

    fn check_update(&self, network: &TenantNetwork) -> Result<()> {
        network.validate()?;
        let existing = self
            .networks
            .get(&network.tenant_id)
            .ok_or_else(|| Error::TenantNotFound(network.tenant_id.clone()))?;
        if existing.subnet_cidr != network.subnet_cidr
            || existing.network_name != network.network_name
        {
            return Err(Error::Internal(format!(
                "network identity of tenant {} cannot change ({} {} -> {} {})",
                network.tenant_id,
                existing.network_name,
                existing.subnet_cidr,
                network.network_name,
                network.subnet_cidr
            )));
        }
        Ok(())
    }

    /// Check every record and the cross-record uniqueness rules
    fn validate(&self) -> Result<()> {
        let mut seen = StoreData::new();
        for (tenant_id, network) in &self.networks {
            if tenant_id != &network.tenant_id {
                return Err(Error::CorruptRecord {
                    tenant_id: tenant_id.clone(),
                    detail: format!("record keyed under {} belongs to {}", tenant_id, network.tenant_id),
                });
            }
            seen.check_insert(network)?;
            seen.networks.insert(tenant_id.clone(), network.clone());
        }
        Ok(())
    }
}

impl Default for StoreData {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NetworkStore for MemoryStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantNetwork>> {
        Ok(self.data.read().networks.get(tenant_id).cloned())
    }

    async fn list(&self) -> Result<Vec<TenantNetwork>> {
        Ok(self.data.read().networks.values().cloned().collect())
    }

    async fn insert(&self, network: TenantNetwork) -> Result<()> {
        let mut data = self.data.write();
        data.check_insert(&network)?;
        data.networks.insert(network.tenant_id.clone(), network);
        Ok(())
    }

    async fn update(&self, network: TenantNetwork) -> Result<()> {
        let mut data = self.data.write();
        data.check_update(&network)?;
        data.networks.insert(network.tenant_id.clone(), network);
        Ok(())
    }
}

/// JSON document store
///
/// Every mutation rewrites the whole document through a temp file, fsync and
/// rename, so a crash leaves either the old or the new document. The
/// in-memory copy only changes after the rename succeeded.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty when the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let data: StoreData = serde_json::from_str(&content).map_err(|e| {
                    Error::Storage(format!("Failed to parse {}: {}", path.display(), e))
                })?;
                if data.version > StoreData::CURRENT_VERSION {
                    return Err(Error::Storage(format!(
                        "{} has format version {}, newer than supported {}",
                        path.display(),
                        data.version,
                        StoreData::CURRENT_VERSION
                    )));
                }
                data.validate()?;
                info!(
                    path = %path.display(),
                    networks = data.networks.len(),
                    "Loaded tenant network store"
                );
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No store file, starting empty");
                StoreData::new()
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Storage(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let content = serde_json::to_vec_pretty(data)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| {
            Error::Storage(format!("Failed to create {}: {}", tmp.display(), e))
        })?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to move {} into place: {}",
                tmp.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), bytes = content.len(), "Persisted store");
        Ok(())
    }
}

#[async_trait]
impl NetworkStore for JsonFileStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantNetwork>> {
        Ok(self.data.lock().await.networks.get(tenant_id).cloned())
    }

    async fn list(&self) -> Result<Vec<TenantNetwork>> {
        Ok(self.data.lock().await.networks.values().cloned().collect())
    }

    async fn insert(&self, network: TenantNetwork) -> Result<()> {
        let mut data = self.data.lock().await;
        data.check_insert(&network)?;

        let mut next = data.clone();
        next.version = StoreData::CURRENT_VERSION;
        next.networks.insert(network.tenant_id.clone(), network);
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }

    async fn update(&self, network: TenantNetwork) -> Result<()> {
        let mut data = self.data.lock().await;
        data.check_update(&network)?;

        let mut next = data.clone();
        next.version = StoreData::CURRENT_VERSION;
        next.networks.insert(network.tenant_id.clone(), network);
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }
}
