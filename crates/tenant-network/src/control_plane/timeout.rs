//! Timeout-bounded control plane
//!
//! Wraps any backend so that every call either finishes within a fixed
//! budget or fails with `ControlPlaneTimeout`.

use super::traits::{BackendType, ControlPlane, DefineOutcome, DhcpHost, NetworkDefinition};
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Control plane decorator applying a per-call timeout
pub struct TimeoutControlPlane {
    inner: Arc<dyn ControlPlane>,
    timeout: Duration,
}

impl TimeoutControlPlane {
    pub fn new(inner: Arc<dyn ControlPlane>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?self.timeout, "Control plane call timed out");
                Err(Error::ControlPlaneTimeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl ControlPlane for TimeoutControlPlane {
    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    async fn define_network(&self, definition: &NetworkDefinition) -> Result<DefineOutcome> {
        self.bounded("define_network", self.inner.define_network(definition))
            .await
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        self.bounded("start_network", self.inner.start_network(name))
            .await
    }

    async fn autostart_network(&self, name: &str) -> Result<()> {
        self.bounded("autostart_network", self.inner.autostart_network(name))
            .await
    }

    async fn is_live(&self, name: &str) -> Result<bool> {
        self.bounded("is_live", self.inner.is_live(name)).await
    }

    async fn add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<()> {
        self.bounded("add_dhcp_host", self.inner.add_dhcp_host(network, host))
            .await
    }

    async fn delete_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<bool> {
        self.bounded("delete_dhcp_host", self.inner.delete_dhcp_host(network, host))
            .await
    }
}
