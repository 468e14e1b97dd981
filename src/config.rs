//! Configuration loading via `ortho-config`.

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::driver::{MachineConfig, MachineConfigError};

/// Boot image published for fresh machines.
pub const DEFAULT_BOOT_IMAGE_URL: &str =
    "https://storage.googleapis.com/minikube/iso/minikube-v0.18.0.iso";

/// Private network new machines join unless configured otherwise.
pub const DEFAULT_PRIVATE_NETWORK: &str = "kvm-machines";

/// Driver defaults derived from environment variables, configuration files,
/// and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "KVM_MACHINE")]
pub struct DriverConfig {
    /// Source of the boot image staged into new machine directories.
    #[ortho_config(default = DEFAULT_BOOT_IMAGE_URL.to_owned())]
    pub boot_image_url: String,
    /// Virtual CPU count for new machines.
    #[ortho_config(default = 1)]
    pub cpu_count: u32,
    /// Memory size in megabytes for new machines.
    #[ortho_config(default = 2048)]
    pub memory_mb: u32,
    /// Disk size in megabytes for new machines.
    #[ortho_config(default = 20_000)]
    pub disk_size_mb: u64,
    /// Private network shared by this host's machines.
    #[ortho_config(default = DEFAULT_PRIVATE_NETWORK.to_owned())]
    pub network_name: String,
    /// Disk cache mode passed through to the domain definition.
    #[ortho_config(default = "threads".to_owned())]
    pub cache_mode: String,
    /// Hypervisor management endpoint.
    #[ortho_config(default = "qemu:///system".to_owned())]
    pub libvirt_uri: String,
    /// Store root; falls back to `~/.kvm-machine` when unset.
    pub store_path: Option<Utf8PathBuf>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl DriverConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to kvm-machine.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_nonzero(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidField(format!(
                "{} must be greater than zero: set {} or {} in kvm-machine.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags
    /// in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    /// Values still merge defaults, configuration files, and environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kvm-machine")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves the store root: an explicit override wins, then the
    /// configured path, then `~/.kvm-machine`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no path is configured and
    /// `HOME` is unset.
    pub fn store_root(&self, explicit: Option<Utf8PathBuf>) -> Result<Utf8PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path);
        }
        if let Some(path) = &self.store_path {
            return Ok(path.clone());
        }
        std::env::var("HOME")
            .map(|home| Utf8PathBuf::from(home).join(".kvm-machine"))
            .map_err(|_| {
                ConfigError::MissingField(String::from(
                    "missing store path: set KVM_MACHINE_STORE_PATH or store_path in kvm-machine.toml",
                ))
            })
    }

    /// Builds a [`MachineConfig`] for `name` under `store_root` using the
    /// configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_machine_config(
        &self,
        name: &str,
        store_root: &Utf8Path,
    ) -> Result<MachineConfig, ConfigError> {
        self.validate()?;
        MachineConfig::builder()
            .name(name)
            .store_path(store_root)
            .boot_image_url(&self.boot_image_url)
            .cpu_count(self.cpu_count)
            .memory_mb(self.memory_mb)
            .disk_size_mb(self.disk_size_mb)
            .network_name(&self.network_name)
            .cache_mode(&self.cache_mode)
            .build()
            .map_err(ConfigError::from)
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values via environment
    /// variables or the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty or zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.boot_image_url,
            &FieldMetadata::new(
                "boot image source",
                "KVM_MACHINE_BOOT_IMAGE_URL",
                "boot_image_url",
            ),
        )?;
        Self::require_field(
            &self.network_name,
            &FieldMetadata::new(
                "private network name",
                "KVM_MACHINE_NETWORK_NAME",
                "network_name",
            ),
        )?;
        Self::require_field(
            &self.cache_mode,
            &FieldMetadata::new("disk cache mode", "KVM_MACHINE_CACHE_MODE", "cache_mode"),
        )?;
        Self::require_field(
            &self.libvirt_uri,
            &FieldMetadata::new("libvirt URI", "KVM_MACHINE_LIBVIRT_URI", "libvirt_uri"),
        )?;
        Self::require_nonzero(
            u64::from(self.cpu_count),
            &FieldMetadata::new("virtual CPU count", "KVM_MACHINE_CPU_COUNT", "cpu_count"),
        )?;
        Self::require_nonzero(
            u64::from(self.memory_mb),
            &FieldMetadata::new("memory size", "KVM_MACHINE_MEMORY_MB", "memory_mb"),
        )?;
        Self::require_nonzero(
            self.disk_size_mb,
            &FieldMetadata::new("disk size", "KVM_MACHINE_DISK_SIZE_MB", "disk_size_mb"),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration field holds an unusable value.
    #[error("invalid configuration field: {0}")]
    InvalidField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<MachineConfigError> for ConfigError {
    fn from(value: MachineConfigError) -> Self {
        Self::InvalidField(value.to_string())
    }
}
