//! Error types for the KVM driver.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::bundle::BundleError;
use crate::discovery::DiscoveryError;
use crate::driver::MachineState;
use crate::hypervisor::{HypervisorError, ResourceKind};
use crate::image::ImageError;

/// Errors raised by KVM driver operations.
///
/// Every hypervisor failure is wrapped with the operation the driver was
/// performing so the host tool receives a causal chain.
#[derive(Debug, Error)]
pub enum KvmDriverError {
    /// Raised when a hypervisor call fails during a named operation.
    #[error("{operation}: {source}")]
    Hypervisor {
        /// Operation the driver was performing.
        operation: &'static str,
        /// Failure reported at the hypervisor seam.
        #[source]
        source: HypervisorError,
    },
    /// Raised when the boot image cannot be staged.
    #[error("staging boot image: {0}")]
    Image(#[from] ImageError),
    /// Raised when the cert bundle cannot be built.
    #[error("building cert bundle: {0}")]
    Bundle(#[from] BundleError),
    /// Raised when the machine directory cannot be prepared.
    #[error("preparing machine directory {path}: {message}")]
    MachineDir {
        /// Directory being prepared.
        path: Utf8PathBuf,
        /// Underlying failure.
        message: String,
    },
    /// Raised when address discovery fails hard.
    #[error("discovering machine address: {0}")]
    Discovery(#[from] DiscoveryError),
    /// Raised when the start sequence runs out of address poll attempts.
    #[error("machine did not report an IP address after {attempts} attempts")]
    NoAddressAfterTimeout {
        /// Poll attempts performed.
        attempts: u32,
    },
    /// Raised when the stop sequence runs out of state poll attempts.
    #[error("could not stop machine after {attempts} attempts, current state {last_state}")]
    StopTimeout {
        /// Poll attempts performed.
        attempts: u32,
        /// State observed on the final poll.
        last_state: MachineState,
    },
    /// Raised when an address is requested while the machine is not running.
    #[error("host is not running")]
    NotRunning,
    /// Raised when the machine is running but no lease has been recorded.
    #[error("machine is running but no address has been assigned yet")]
    AddressUnassigned,
    /// Raised when teardown fails on a sub-resource that was still present.
    #[error("removing {kind}: {source}")]
    Teardown {
        /// Sub-resource being removed.
        kind: ResourceKind,
        /// Failure reported at the hypervisor seam.
        #[source]
        source: HypervisorError,
    },
}

impl KvmDriverError {
    pub(super) const fn hypervisor(operation: &'static str, source: HypervisorError) -> Self {
        Self::Hypervisor { operation, source }
    }

    pub(super) const fn teardown(kind: ResourceKind, source: HypervisorError) -> Self {
        Self::Teardown { kind, source }
    }
}
