//! Machine-lifecycle driver for KVM.
//!
//! The crate exposes a driver contract for host-provisioning tools
//! ([`MachineDriver`]) and a KVM implementation that owns the lifecycle
//! state machine (create → start → poll for an address → wait for SSH →
//! stop/remove), its templated hypervisor resources, and the IP-discovery
//! protocol that bridges VM boot to SSH reachability.
//!
//! Hypervisor access goes through the [`Hypervisor`] seam; the libvirt
//! adapter behind the default-on `libvirt` cargo feature implements it over
//! `qemu:///system`. Everything above the seam builds and tests without the
//! libvirt C library (`--no-default-features`).

pub mod bundle;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod hypervisor;
pub mod image;
pub mod kvm;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod network;
pub mod store;
pub mod test_support;
pub mod xml;

pub use config::DriverConfig;
pub use driver::{
    DriverFuture, MachineConfig, MachineConfigBuilder, MachineDriver, MachineState,
};
pub use hypervisor::{Hypervisor, HypervisorError, PowerState};
pub use kvm::{KvmDriver, KvmDriverError, SshProbe, TcpProbe, TeardownOutcome, TeardownReport};
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtHypervisor;
pub use store::{MachineStore, StoreError};
