//! Hypervisor seam consumed by the lifecycle state machine.
//!
//! Every hypervisor-facing operation the driver performs goes through the
//! [`Hypervisor`] trait so the lifecycle logic can be exercised against a
//! scripted fake. The libvirt adapter implements it by opening a fresh
//! connection per call and releasing it before returning.

use std::fmt;

use thiserror::Error;

/// Power state the hypervisor reports for a defined domain.
///
/// This mirrors the hypervisor's own vocabulary; the driver-level
/// [`MachineState`](crate::driver::MachineState) is derived from it through a
/// fixed total mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// The domain is defined but has no state yet.
    NoState,
    /// The domain is running.
    Running,
    /// The domain is blocked on a resource.
    Blocked,
    /// The domain has been paused.
    Paused,
    /// The domain is in the process of shutting down.
    Shutdown,
    /// The domain is powered off.
    Shutoff,
    /// The domain has crashed.
    Crashed,
    /// The domain has been suspended to memory by power management.
    Suspended,
    /// A state value this driver does not recognise.
    Unknown,
}

/// Resource categories the hypervisor manages on the driver's behalf.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// A compute domain.
    Domain,
    /// A virtual network.
    Network,
    /// A storage pool.
    StoragePool,
    /// A storage volume inside a pool.
    StorageVolume,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Domain => "domain",
            Self::Network => "network",
            Self::StoragePool => "storage pool",
            Self::StorageVolume => "storage volume",
        };
        f.write_str(label)
    }
}

/// Errors raised at the hypervisor seam.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HypervisorError {
    /// Raised when the hypervisor management endpoint cannot be reached.
    #[error("cannot reach hypervisor: {message}")]
    Connection {
        /// Message reported while opening the connection.
        message: String,
    },
    /// Raised when an API call against an open connection fails.
    #[error("{operation}: {message}")]
    Api {
        /// Operation the driver was performing.
        operation: &'static str,
        /// Message reported by the hypervisor.
        message: String,
    },
    /// Raised when a named resource does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Category of the missing resource.
        kind: ResourceKind,
        /// Name used for the lookup.
        name: String,
    },
    /// Raised when the hypervisor does not support the requested call.
    #[error("{operation} is not supported by this hypervisor")]
    Unsupported {
        /// Operation the hypervisor rejected.
        operation: &'static str,
    },
}

impl HypervisorError {
    /// Returns `true` when the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` when the error reports an unsupported capability.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Operations the driver needs from a hypervisor.
///
/// Implementations open whatever handles they need per call and release them
/// before returning; no handle survives across calls.
pub trait Hypervisor {
    /// Returns the hypervisor library version as an encoded number
    /// (`major * 1_000_000 + minor * 1_000 + release`).
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::Connection`] when the endpoint is
    /// unreachable.
    fn library_version(&self) -> Result<u64, HypervisorError>;

    /// Defines a domain from rendered XML without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the definition is rejected.
    fn define_domain(&self, xml: &str) -> Result<(), HypervisorError>;

    /// Removes the named domain's definition.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the domain does not exist.
    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Powers on the named domain.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the domain is missing or the power-on
    /// call fails.
    fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Requests a graceful shutdown of the named domain.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the domain is missing or the request
    /// fails.
    fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Forcibly destroys the named domain regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the domain is missing or the destroy
    /// call fails.
    fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Reports the named domain's power state.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the domain does not exist.
    fn domain_power_state(&self, name: &str) -> Result<PowerState, HypervisorError>;

    /// Lists the addresses the hypervisor knows for the named domain's
    /// interfaces, as reported by its lease records.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::Unsupported`] when the hypervisor predates
    /// the interface-address query.
    fn domain_interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError>;

    /// Reports whether the named network is active.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the network does not exist.
    fn network_is_active(&self, name: &str) -> Result<bool, HypervisorError>;

    /// Defines a network from rendered XML without activating it.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the definition is rejected.
    fn define_network(&self, xml: &str) -> Result<(), HypervisorError>;

    /// Flags the named network for automatic activation on host restart.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the network does not exist.
    fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<(), HypervisorError>;

    /// Activates the named network.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the network is missing or activation
    /// fails.
    fn activate_network(&self, name: &str) -> Result<(), HypervisorError>;

    /// Deactivates the named network.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the network is missing or the call
    /// fails.
    fn destroy_network(&self, name: &str) -> Result<(), HypervisorError>;

    /// Removes the named network's definition.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the network does not exist.
    fn undefine_network(&self, name: &str) -> Result<(), HypervisorError>;

    /// Allocates a volume inside the named pool from rendered XML.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the pool does not exist, or
    /// [`HypervisorError::Api`] when allocation fails.
    fn create_volume(&self, pool: &str, xml: &str) -> Result<(), HypervisorError>;

    /// Writes `payload` at offset zero of the named volume.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the pool or volume is missing or the
    /// upload fails.
    fn upload_volume(&self, pool: &str, volume: &str, payload: &[u8])
    -> Result<(), HypervisorError>;

    /// Deletes the named volume from the named pool.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotFound`] when the pool or volume does not
    /// exist.
    fn delete_volume(&self, pool: &str, volume: &str) -> Result<(), HypervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate_matches_only_not_found() {
        let missing = HypervisorError::NotFound {
            kind: ResourceKind::Network,
            name: String::from("default"),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_unsupported());

        let api = HypervisorError::Api {
            operation: "defining domain",
            message: String::from("boom"),
        };
        assert!(!api.is_not_found());
    }

    #[test]
    fn resource_kind_labels_are_human_readable() {
        assert_eq!(ResourceKind::StoragePool.to_string(), "storage pool");
        assert_eq!(ResourceKind::Domain.to_string(), "domain");
    }
}
