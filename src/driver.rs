//! Driver abstraction for machine-lifecycle plugins.
//!
//! [`MachineDriver`] is the contract a host-provisioning tool consumes: the
//! lifecycle operations, the state query, and the accessors it needs to reach
//! the machine over SSH. [`MachineConfig`] is the durable, caller-supplied
//! description of one machine.

use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hypervisor::PowerState;

/// File name of the staged boot image inside the machine directory.
pub const BOOT_IMAGE_FILE: &str = "boot2docker.iso";

/// File name of the generated SSH private key inside the machine directory.
pub const SSH_KEY_FILE: &str = "id_rsa";

/// Directory the hypervisor's default storage pool is backed by.
pub const DEFAULT_POOL_DIR: &str = "/var/lib/libvirt/images";

/// Durable description of one virtual machine.
///
/// Constructed once when the driver is instantiated and never mutated
/// afterwards; the cached IP address and SSH port live in the driver's
/// runtime state, not here.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MachineConfig {
    /// Machine name, also used for the domain and derived resource names.
    pub name: String,
    /// Root of the host tool's store; machine files live under
    /// `<store>/machines/<name>`.
    pub store_path: Utf8PathBuf,
    /// Source of the boot image: an HTTP(S) URL or a local path.
    pub boot_image_url: String,
    /// Path the boot image is staged to before first boot.
    pub iso_path: Utf8PathBuf,
    /// Path of the generated SSH private key.
    pub ssh_key_path: Utf8PathBuf,
    /// Number of virtual CPUs.
    pub cpu_count: u32,
    /// Memory size in megabytes.
    pub memory_mb: u32,
    /// Disk size in megabytes.
    pub disk_size_mb: u64,
    /// Name of the private network the machine's second interface joins.
    pub network_name: String,
    /// Path of the machine's disk as referenced by the domain definition.
    pub disk_path: Utf8PathBuf,
    /// Disk cache mode passed through to the domain definition.
    pub cache_mode: String,
}

impl MachineConfig {
    /// Starts a builder for a [`MachineConfig`].
    #[must_use]
    pub fn builder() -> MachineConfigBuilder {
        MachineConfigBuilder::default()
    }

    /// Directory holding this machine's files.
    #[must_use]
    pub fn machine_dir(&self) -> Utf8PathBuf {
        self.store_path.join("machines").join(&self.name)
    }

    /// Name of the machine's storage volume inside the default pool.
    #[must_use]
    pub fn volume_name(&self) -> String {
        format!("{}-pool0-vol0", self.name)
    }

    /// Path of the generated SSH public key.
    #[must_use]
    pub fn ssh_public_key_path(&self) -> Utf8PathBuf {
        let mut path = self.ssh_key_path.clone().into_string();
        path.push_str(".pub");
        Utf8PathBuf::from(path)
    }

    /// Validates the configuration, returning a descriptive error for the
    /// first missing or out-of-range field.
    ///
    /// # Errors
    ///
    /// Returns [`MachineConfigError`] when a required field is empty or a
    /// size is zero.
    pub fn validate(&self) -> Result<(), MachineConfigError> {
        if self.name.trim().is_empty() {
            return Err(MachineConfigError::MissingField("name"));
        }
        if self.store_path.as_str().trim().is_empty() {
            return Err(MachineConfigError::MissingField("store_path"));
        }
        if self.boot_image_url.trim().is_empty() {
            return Err(MachineConfigError::MissingField("boot_image_url"));
        }
        if self.network_name.trim().is_empty() {
            return Err(MachineConfigError::MissingField("network_name"));
        }
        if self.cache_mode.trim().is_empty() {
            return Err(MachineConfigError::MissingField("cache_mode"));
        }
        if self.cpu_count == 0 {
            return Err(MachineConfigError::ZeroField("cpu_count"));
        }
        if self.memory_mb == 0 {
            return Err(MachineConfigError::ZeroField("memory_mb"));
        }
        if self.disk_size_mb == 0 {
            return Err(MachineConfigError::ZeroField("disk_size_mb"));
        }
        Ok(())
    }
}

/// Builder for [`MachineConfig`] that derives the per-machine paths when the
/// caller does not override them.
#[derive(Clone, Debug, Default)]
pub struct MachineConfigBuilder {
    name: String,
    store_path: Utf8PathBuf,
    boot_image_url: String,
    iso_path: Option<Utf8PathBuf>,
    ssh_key_path: Option<Utf8PathBuf>,
    cpu_count: u32,
    memory_mb: u32,
    disk_size_mb: u64,
    network_name: String,
    disk_path: Option<Utf8PathBuf>,
    cache_mode: String,
}

impl MachineConfigBuilder {
    /// Sets the machine name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the store root.
    #[must_use]
    pub fn store_path(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.store_path = value.into();
        self
    }

    /// Sets the boot image source.
    #[must_use]
    pub fn boot_image_url(mut self, value: impl Into<String>) -> Self {
        self.boot_image_url = value.into();
        self
    }

    /// Overrides the staged boot image path.
    #[must_use]
    pub fn iso_path(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.iso_path = Some(value.into());
        self
    }

    /// Overrides the SSH private key path.
    #[must_use]
    pub fn ssh_key_path(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.ssh_key_path = Some(value.into());
        self
    }

    /// Sets the virtual CPU count.
    #[must_use]
    pub const fn cpu_count(mut self, value: u32) -> Self {
        self.cpu_count = value;
        self
    }

    /// Sets the memory size in megabytes.
    #[must_use]
    pub const fn memory_mb(mut self, value: u32) -> Self {
        self.memory_mb = value;
        self
    }

    /// Sets the disk size in megabytes.
    #[must_use]
    pub const fn disk_size_mb(mut self, value: u64) -> Self {
        self.disk_size_mb = value;
        self
    }

    /// Sets the private network name.
    #[must_use]
    pub fn network_name(mut self, value: impl Into<String>) -> Self {
        self.network_name = value.into();
        self
    }

    /// Overrides the disk path referenced by the domain definition.
    #[must_use]
    pub fn disk_path(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.disk_path = Some(value.into());
        self
    }

    /// Sets the disk cache mode.
    #[must_use]
    pub fn cache_mode(mut self, value: impl Into<String>) -> Self {
        self.cache_mode = value.into();
        self
    }

    /// Builds and validates the [`MachineConfig`], deriving any path the
    /// caller left unset.
    ///
    /// # Errors
    ///
    /// Returns [`MachineConfigError`] when a required field is empty or a
    /// size is zero.
    pub fn build(self) -> Result<MachineConfig, MachineConfigError> {
        let name = self.name.trim().to_owned();
        let machine_dir = self.store_path.join("machines").join(&name);
        let config = MachineConfig {
            iso_path: self
                .iso_path
                .unwrap_or_else(|| machine_dir.join(BOOT_IMAGE_FILE)),
            ssh_key_path: self
                .ssh_key_path
                .unwrap_or_else(|| machine_dir.join(SSH_KEY_FILE)),
            disk_path: self
                .disk_path
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_POOL_DIR).join(format!("{name}-pool0-vol0"))),
            name,
            store_path: self.store_path,
            boot_image_url: self.boot_image_url.trim().to_owned(),
            cpu_count: self.cpu_count,
            memory_mb: self.memory_mb,
            disk_size_mb: self.disk_size_mb,
            network_name: self.network_name.trim().to_owned(),
            cache_mode: self.cache_mode.trim().to_owned(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Errors raised while validating a [`MachineConfig`].
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum MachineConfigError {
    /// Raised when a required string field is empty.
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),
    /// Raised when a size field is zero.
    #[error("field must be greater than zero: {0}")]
    ZeroField(&'static str),
}

/// Driver-level machine state, derived from the hypervisor's reported power
/// state through a fixed total mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MachineState {
    /// No domain exists, or the hypervisor reported a state this driver does
    /// not recognise.
    Undefined,
    /// The machine is running.
    Running,
    /// The machine is blocked or has crashed.
    Error,
    /// The machine is paused.
    Paused,
    /// The machine is shut down or powered off.
    Stopped,
    /// The machine has been suspended.
    Saved,
}

impl From<PowerState> for MachineState {
    fn from(value: PowerState) -> Self {
        match value {
            PowerState::Running => Self::Running,
            PowerState::Blocked | PowerState::Crashed => Self::Error,
            PowerState::Paused => Self::Paused,
            PowerState::Shutdown | PowerState::Shutoff => Self::Stopped,
            PowerState::Suspended => Self::Saved,
            PowerState::NoState | PowerState::Unknown => Self::Undefined,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Undefined => "undefined",
            Self::Running => "running",
            Self::Error => "error",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Saved => "saved",
        };
        f.write_str(label)
    }
}

/// Future returned by driver operations.
pub type DriverFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Contract exposed to the host-provisioning tool.
///
/// One driver instance manages exactly one machine; operations are invoked
/// one at a time.
pub trait MachineDriver {
    /// Driver-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short identifier of the driver implementation.
    fn driver_name(&self) -> &'static str;

    /// The machine configuration this driver was instantiated with.
    fn config(&self) -> &MachineConfig;

    /// Provisions the machine's resources and starts it.
    fn create(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Powers the machine on and waits until it is reachable.
    fn start(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Gracefully stops the machine.
    fn stop(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Stops, then starts the machine; a stop failure aborts the restart.
    fn restart(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Forcibly powers the machine off without waiting.
    fn kill(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Tears the machine's resources down, best-effort.
    fn remove(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Reports the machine's current state.
    fn state(&self) -> DriverFuture<'_, MachineState, Self::Error>;

    /// Reports the machine's discovered address; fails unless the machine is
    /// running.
    fn ip(&self) -> DriverFuture<'_, Ipv4Addr, Self::Error>;

    /// Composes the remote management URL after confirming SSH reachability.
    fn url(&self) -> DriverFuture<'_, String, Self::Error>;

    /// Validates hypervisor reachability and logs its version.
    fn pre_command_check(&self) -> DriverFuture<'_, (), Self::Error>;

    /// Hostname to use for SSH; the discovered address.
    fn ssh_hostname(&self) -> DriverFuture<'_, Ipv4Addr, Self::Error>;

    /// User account the guest accepts SSH logins for.
    fn ssh_username(&self) -> &str;

    /// Path of the machine's SSH private key.
    fn ssh_key_path(&self) -> &Utf8Path;

    /// TCP port the guest serves SSH on.
    fn ssh_port(&self) -> u16;
}
