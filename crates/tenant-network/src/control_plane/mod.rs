//! Control plane adapters
//!
//! The engine talks to the hypervisor's network manager through the
//! [`ControlPlane`] trait:
//!
//! 1. **Virsh** - libvirt through the `virsh` CLI, the production backend
//! 2. **Memory** - in-process state with fault injection, for tests and dry runs
//!
//! [`build`] picks the backend from configuration and wraps it in a
//! [`TimeoutControlPlane`] so no call can hang the engine.

mod memory;
mod timeout;
mod traits;
pub mod virsh;

pub use memory::{MemoryControlPlane, Operation};
pub use timeout::TimeoutControlPlane;
pub use traits::{BackendType, ControlPlane, DefineOutcome, DhcpHost, NetworkDefinition};
pub use virsh::VirshControlPlane;

use crate::config::ControlPlaneConfig;
use std::sync::Arc;
use tracing::info;

/// Build the configured backend, bounded by the configured timeout
pub fn build(config: &ControlPlaneConfig) -> Arc<dyn ControlPlane> {
    let backend: Arc<dyn ControlPlane> = match config.backend {
        BackendType::Virsh => Arc::new(VirshControlPlane::from_config(config)),
        BackendType::Memory => Arc::new(MemoryControlPlane::new()),
    };
    info!(
        backend = %config.backend,
        timeout = ?config.timeout(),
        "Control plane backend selected"
    );
    Arc::new(TimeoutControlPlane::new(backend, config.timeout()))
}
