//! Best-effort teardown.

use crate::driver::MachineState;
use crate::hypervisor::{Hypervisor, HypervisorError, ResourceKind};
use crate::xml::{DEFAULT_NETWORK_NAME, DEFAULT_POOL_NAME};

use super::{KvmDriver, KvmDriverError, SshProbe};

/// Outcome of removing one sub-resource during teardown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownOutcome {
    /// The resource existed and was removed.
    Removed,
    /// The resource was already gone; treated as success.
    AlreadyAbsent,
    /// The resource was deliberately left in place.
    Retained,
}

/// Per-resource outcomes of a best-effort removal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TeardownReport {
    /// Outcome for the private network.
    pub network: TeardownOutcome,
    /// Outcome for the storage volume.
    pub volume: TeardownOutcome,
    /// Outcome for the compute domain.
    pub domain: TeardownOutcome,
}

impl<H: Hypervisor, P: SshProbe> KvmDriver<H, P> {
    /// Tears down the machine's network, volume, and domain in that order.
    ///
    /// Each sub-resource yields its own outcome; a resource that is already
    /// gone counts as removed, and only a failure on a resource that is
    /// still present aborts the teardown. The shared `default` network is
    /// never deleted since other machines may use it.
    pub(super) fn run_remove(&mut self) -> Result<TeardownReport, KvmDriverError> {
        tracing::debug!(machine = %self.config.name, "removing machine resources");
        let network = self.remove_network()?;
        let volume = self.remove_volume()?;
        let domain = self.remove_domain()?;
        self.runtime.ip_address = None;
        tracing::info!(?network, ?volume, ?domain, "teardown finished");
        Ok(TeardownReport {
            network,
            volume,
            domain,
        })
    }

    fn remove_network(&self) -> Result<TeardownOutcome, KvmDriverError> {
        let name = &self.config.network_name;
        if name == DEFAULT_NETWORK_NAME {
            tracing::debug!("leaving shared default network in place");
            return Ok(TeardownOutcome::Retained);
        }
        match self.hypervisor.network_is_active(name) {
            Err(err) if err.is_not_found() => return Ok(TeardownOutcome::AlreadyAbsent),
            Err(err) => return Err(KvmDriverError::teardown(ResourceKind::Network, err)),
            Ok(true) => {
                self.hypervisor
                    .destroy_network(name)
                    .map_err(|err| KvmDriverError::teardown(ResourceKind::Network, err))?;
            }
            Ok(false) => {}
        }
        finish(
            self.hypervisor.undefine_network(name),
            ResourceKind::Network,
        )
    }

    fn remove_volume(&self) -> Result<TeardownOutcome, KvmDriverError> {
        // A missing pool means the volume cannot exist either; both lookups
        // report absence rather than failure.
        finish(
            self.hypervisor
                .delete_volume(DEFAULT_POOL_NAME, &self.config.volume_name()),
            ResourceKind::StorageVolume,
        )
    }

    fn remove_domain(&self) -> Result<TeardownOutcome, KvmDriverError> {
        let name = &self.config.name;
        match self.hypervisor.domain_power_state(name) {
            Err(err) if err.is_not_found() => return Ok(TeardownOutcome::AlreadyAbsent),
            Err(err) => return Err(KvmDriverError::teardown(ResourceKind::Domain, err)),
            Ok(power) => {
                let state = MachineState::from(power);
                if !matches!(state, MachineState::Stopped | MachineState::Undefined) {
                    self.hypervisor
                        .destroy_domain(name)
                        .map_err(|err| KvmDriverError::teardown(ResourceKind::Domain, err))?;
                }
            }
        }
        finish(self.hypervisor.undefine_domain(name), ResourceKind::Domain)
    }
}

fn finish(
    result: Result<(), HypervisorError>,
    kind: ResourceKind,
) -> Result<TeardownOutcome, KvmDriverError> {
    match result {
        Ok(()) => Ok(TeardownOutcome::Removed),
        Err(err) if err.is_not_found() => Ok(TeardownOutcome::AlreadyAbsent),
        Err(err) => Err(KvmDriverError::teardown(kind, err)),
    }
}
