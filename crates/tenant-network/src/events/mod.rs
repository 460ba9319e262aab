//! Allocation lifecycle events
//!
//! The engine publishes a [`NetworkEvent`] after every state change it makes,
//! wrapped in an [`EventEnvelope`]. Subscribers receive them over a tokio
//! broadcast channel; having no subscribers is a valid state and publishing
//! never fails the operation that produced the event.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::MacAddress;

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tenant network event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// A tenant's network was defined, started and recorded
    NetworkProvisioned {
        tenant_id: String,
        network_name: String,
        subnet: Ipv4Net,
    },

    /// A recorded network was found down and brought back up
    NetworkHealed {
        tenant_id: String,
        network_name: String,
    },

    /// A new static address was persisted for a VM
    AllocationCreated {
        tenant_id: String,
        vm_name: String,
        ip: Ipv4Addr,
        mac: MacAddress,
    },

    /// The DHCP reservation for a VM now matches its allocation
    ReservationSynced {
        tenant_id: String,
        network_name: String,
        vm_name: String,
        ip: Ipv4Addr,
    },

    /// The DHCP reservation could not be written; the allocation is kept
    ReservationSyncFailed {
        tenant_id: String,
        vm_name: String,
        error: String,
    },

    /// A VM's allocation was removed
    AllocationReleased {
        tenant_id: String,
        vm_name: String,
        ip: Ipv4Addr,
        /// Whether the DHCP reservation was removed as well
        reservation_removed: bool,
    },
}

impl NetworkEvent {
    pub fn tenant_id(&self) -> &str {
        match self {
            NetworkEvent::NetworkProvisioned { tenant_id, .. }
            | NetworkEvent::NetworkHealed { tenant_id, .. }
            | NetworkEvent::AllocationCreated { tenant_id, .. }
            | NetworkEvent::ReservationSynced { tenant_id, .. }
            | NetworkEvent::ReservationSyncFailed { tenant_id, .. }
            | NetworkEvent::AllocationReleased { tenant_id, .. } => tenant_id,
        }
    }

    /// Short human readable summary
    pub fn description(&self) -> String {
        match self {
            NetworkEvent::NetworkProvisioned {
                tenant_id,
                network_name,
                subnet,
            } => format!("network {} ({}) provisioned for {}", network_name, subnet, tenant_id),
            NetworkEvent::NetworkHealed { network_name, .. } => {
                format!("network {} restarted", network_name)
            }
            NetworkEvent::AllocationCreated { vm_name, ip, mac, .. } => {
                format!("{} allocated {} ({})", vm_name, ip, mac)
            }
            NetworkEvent::ReservationSynced { vm_name, ip, .. } => {
                format!("{} reservation synced to {}", vm_name, ip)
            }
            NetworkEvent::ReservationSyncFailed { vm_name, error, .. } => {
                format!("{} reservation sync failed: {}", vm_name, error)
            }
            NetworkEvent::AllocationReleased { vm_name, ip, .. } => {
                format!("{} released {}", vm_name, ip)
            }
        }
    }
}

/// Event with identity and time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: NetworkEvent,
}

impl EventEnvelope {
    pub fn new(event: NetworkEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Broadcast publisher for [`NetworkEvent`]s
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn publish(&self, event: NetworkEvent) {
        let envelope = EventEnvelope::new(event);
        trace!(event_id = %envelope.id, "{}", envelope.event.description());
        // Err only means nobody is listening
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn released() -> NetworkEvent {
        NetworkEvent::AllocationReleased {
            tenant_id: "userA".into(),
            vm_name: "vm1".into(),
            ip: Ipv4Addr::new(10, 200, 10, 10),
            reservation_removed: true,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = EventPublisher::default();
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(released());
    }

    #[tokio::test]
    async fn test_subscribers_receive_envelopes() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(released());
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, released());
        assert_eq!(envelope.event.tenant_id(), "userA");
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(EventEnvelope::new(released())).unwrap();
        assert_eq!(json["event"]["type"], "allocation_released");
        assert_eq!(json["event"]["data"]["ip"], "10.200.10.10");
    }
}
