//! Error types for tenant network allocation

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

/// Result type for tenant network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No free subnet or no free address. Terminal.
    CapacityExhausted,
    /// A control plane call failed or timed out. The caller may retry the whole operation.
    ControlPlaneUnavailable,
    /// Durable state and the control plane disagree in a way that could not be healed
    ConflictingState,
    /// The requested record does not exist
    NotFound,
    /// Storage, configuration or argument problems
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::CapacityExhausted => write!(f, "capacity_exhausted"),
            ErrorKind::ControlPlaneUnavailable => write!(f, "control_plane_unavailable"),
            ErrorKind::ConflictingState => write!(f, "conflicting_state"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Tenant network errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Capacity errors
    #[error("Subnet pool exhausted: every /24 in 10.{base_octet}.{min_octet}.0 - 10.{base_octet}.{max_octet}.0 is allocated")]
    SubnetPoolExhausted {
        base_octet: u8,
        min_octet: u8,
        max_octet: u8,
    },

    #[error("No free addresses left in subnet {0}")]
    NoAddressSpace(Ipv4Net),

    // Control plane errors
    #[error("Control plane {operation} failed: {message}")]
    ControlPlane {
        operation: &'static str,
        message: String,
    },

    #[error("Control plane {operation} timed out after {timeout:?}")]
    ControlPlaneTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    // Conflicts between durable state and the control plane
    #[error("Network {0} is recorded but still not live after restart")]
    NetworkNotLive(String),

    #[error("Network {name} is already defined with different parameters: {detail}")]
    DefinitionMismatch { name: String, detail: String },

    #[error("Subnet {0} is already owned by another tenant")]
    SubnetConflict(Ipv4Net),

    #[error("Network name {0} is already in use")]
    NetworkNameConflict(String),

    #[error("Tenant {0} already has a network")]
    TenantExists(String),

    #[error("IP {ip} is already allocated in network {network}")]
    IpAlreadyAllocated { ip: Ipv4Addr, network: String },

    #[error("Stored network for tenant {tenant_id} is inconsistent: {detail}")]
    CorruptRecord { tenant_id: String, detail: String },

    // Lookup errors
    #[error("No network recorded for tenant {0}")]
    TenantNotFound(String),

    #[error("No allocation for VM {vm_name} in tenant {tenant_id}")]
    AllocationNotFound { tenant_id: String, vm_name: String },

    // General errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SubnetPoolExhausted { .. } | Error::NoAddressSpace(_) => {
                ErrorKind::CapacityExhausted
            }
            Error::ControlPlane { .. } | Error::ControlPlaneTimeout { .. } => {
                ErrorKind::ControlPlaneUnavailable
            }
            Error::NetworkNotLive(_)
            | Error::DefinitionMismatch { .. }
            | Error::SubnetConflict(_)
            | Error::NetworkNameConflict(_)
            | Error::TenantExists(_)
            | Error::IpAlreadyAllocated { .. }
            | Error::CorruptRecord { .. } => ErrorKind::ConflictingState,
            Error::TenantNotFound(_) | Error::AllocationNotFound { .. } => ErrorKind::NotFound,
            Error::Storage(_) | Error::Config(_) | Error::InvalidArgument(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether repeating the whole operation later can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ControlPlaneUnavailable) || matches!(self, Error::Storage(_))
    }

    pub(crate) fn control_plane(operation: &'static str, message: impl Into<String>) -> Self {
        Error::ControlPlane {
            operation,
            message: message.into(),
        }
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::Internal(format!("invalid prefix length: {}", e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("serialization failed: {}", e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors_are_terminal() {
        let err = Error::SubnetPoolExhausted {
            base_octet: 200,
            min_octet: 10,
            max_octet: 12,
        };
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
        assert!(!err.is_retryable());

        let err = Error::NoAddressSpace("10.200.10.0/24".parse().unwrap());
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_control_plane_errors_are_retryable() {
        let err = Error::control_plane("net-start", "libvirtd not running");
        assert_eq!(err.kind(), ErrorKind::ControlPlaneUnavailable);
        assert!(err.is_retryable());

        let err = Error::ControlPlaneTimeout {
            operation: "is_live",
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), ErrorKind::ControlPlaneUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_conflicts() {
        assert_eq!(
            Error::NetworkNotLive("tn-abc-10".into()).kind(),
            ErrorKind::ConflictingState
        );
        assert_eq!(
            Error::SubnetConflict("10.200.10.0/24".parse().unwrap()).kind(),
            ErrorKind::ConflictingState
        );
    }

    #[test]
    fn test_display() {
        let err = Error::SubnetPoolExhausted {
            base_octet: 200,
            min_octet: 10,
            max_octet: 12,
        };
        assert_eq!(
            err.to_string(),
            "Subnet pool exhausted: every /24 in 10.200.10.0 - 10.200.12.0 is allocated"
        );
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
