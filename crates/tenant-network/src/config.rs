//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration.
//!
//! ```toml
//! [pool]
//! base_octet = 200
//! min_octet = 10
//! max_octet = 250
//!
//! [control_plane]
//! backend = "virsh"
//! connect_uri = "qemu:///system"
//! timeout_secs = 10
//!
//! [store]
//! backend = "json"
//! path = "/var/lib/tenant-network/networks.json"
//! ```

use crate::control_plane::BackendType;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum interface name length on Linux, minus the NUL terminator
const MAX_BRIDGE_NAME_LEN: usize = 15;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Subnet pool: /24 blocks `10.<base_octet>.<min_octet..=max_octet>.0`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Second octet of the tenant /16
    #[serde(default = "default_base_octet")]
    pub base_octet: u8,

    /// Lowest third octet handed to a tenant
    #[serde(default = "default_min_octet")]
    pub min_octet: u8,

    /// Highest third octet handed to a tenant (inclusive)
    #[serde(default = "default_max_octet")]
    pub max_octet: u8,
}

fn default_base_octet() -> u8 {
    200
}
fn default_min_octet() -> u8 {
    10
}
fn default_max_octet() -> u8 {
    250
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_octet: default_base_octet(),
            min_octet: default_min_octet(),
            max_octet: default_max_octet(),
        }
    }
}

impl PoolConfig {
    /// The tenant /16 the pool lives in
    pub fn base_network(&self) -> Ipv4Net {
        Ipv4Net::new_assert(Ipv4Addr::new(10, self.base_octet, 0, 0), 16)
    }

    /// Number of tenants the pool can hold
    pub fn capacity(&self) -> usize {
        if self.min_octet > self.max_octet {
            0
        } else {
            usize::from(self.max_octet - self.min_octet) + 1
        }
    }
}

/// Control plane adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Which adapter to drive
    #[serde(default = "default_backend")]
    pub backend: BackendType,

    /// Path to the virsh binary
    #[serde(default = "default_virsh_path")]
    pub virsh_path: String,

    /// libvirt connection URI passed as `virsh -c`
    #[serde(default)]
    pub connect_uri: Option<String>,

    /// Upper bound on a single control plane call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bridge device prefix; the subnet's third octet is appended
    #[serde(default = "default_bridge_prefix")]
    pub bridge_prefix: String,
}

fn default_backend() -> BackendType {
    BackendType::Virsh
}
fn default_virsh_path() -> String {
    "virsh".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_bridge_prefix() -> String {
    "vbr".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            virsh_path: default_virsh_path(),
            connect_uri: None,
            timeout_secs: default_timeout_secs(),
            bridge_prefix: default_bridge_prefix(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Durable store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Versioned JSON document on local disk
    Json,
    /// Process memory only (tests, dry runs)
    Memory,
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Location of the JSON document
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Json
}
fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/tenant-network/networks.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for tests and dry runs: memory store and memory control plane
    pub fn in_memory() -> Self {
        Self {
            control_plane: ControlPlaneConfig {
                backend: BackendType::Memory,
                ..Default::default()
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.min_octet > self.pool.max_octet {
            return Err(Error::Config(format!(
                "pool.min_octet ({}) is greater than pool.max_octet ({})",
                self.pool.min_octet, self.pool.max_octet
            )));
        }

        if self.control_plane.timeout_secs == 0 {
            return Err(Error::Config(
                "control_plane.timeout_secs must be at least 1".to_string(),
            ));
        }

        let prefix = &self.control_plane.bridge_prefix;
        if prefix.is_empty()
            || prefix.len() + 3 > MAX_BRIDGE_NAME_LEN
            || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "control_plane.bridge_prefix {:?} must be 1-{} characters of [A-Za-z0-9_-]",
                prefix,
                MAX_BRIDGE_NAME_LEN - 3
            )));
        }

        if self.control_plane.virsh_path.is_empty() {
            return Err(Error::Config("control_plane.virsh_path is empty".to_string()));
        }

        if self.store.backend == StoreBackend::Json && self.store.path.as_os_str().is_empty() {
            return Err(Error::Config("store.path is empty".to_string()));
        }

        Ok(())
    }
}
