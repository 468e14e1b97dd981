//! Persisted per-machine state under the store root.
//!
//! The host tool owns the store layout's root; the driver only reads and
//! writes files inside it. Each machine keeps its staged boot image, SSH key
//! pair, and serialised configuration under `machines/<name>/`.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;

use crate::driver::MachineConfig;

const CONFIG_FILE_NAME: &str = "config.json";

/// Errors raised while accessing the machine store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when a machine has never been created in this store.
    #[error("machine '{name}' has no saved configuration")]
    MissingMachine {
        /// Machine name used for the lookup.
        name: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing a saved configuration fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a configuration cannot be serialised.
    #[error("failed to serialise machine configuration: {0}")]
    Serialize(String),
}

/// Store of per-machine configuration files under a root directory.
#[derive(Clone, Debug)]
pub struct MachineStore {
    root: Utf8PathBuf,
}

impl MachineStore {
    /// Creates a store rooted at `root`; the directory is created lazily on
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding the named machine's files.
    #[must_use]
    pub fn machine_dir(&self, name: &str) -> Utf8PathBuf {
        self.root.join("machines").join(name)
    }

    fn open_root(&self) -> Result<Dir, StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|err| StoreError::Io {
            path: self.root.clone(),
            message: err.to_string(),
        })?;
        Dir::open_ambient_dir(&self.root, ambient_authority()).map_err(|err| StoreError::Io {
            path: self.root.clone(),
            message: err.to_string(),
        })
    }

    /// Persists the machine's configuration, returning the file it was
    /// written to.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the directory tree cannot be created or
    /// the file cannot be written.
    pub fn save_config(&self, config: &MachineConfig) -> Result<Utf8PathBuf, StoreError> {
        let dir = self.open_root()?;
        let machine_rel = format!("machines/{}", config.name);
        dir.create_dir_all(&machine_rel)
            .map_err(|err| StoreError::Io {
                path: self.machine_dir(&config.name),
                message: err.to_string(),
            })?;

        let rendered = serde_json::to_string_pretty(config)
            .map_err(|err| StoreError::Serialize(err.to_string()))?;
        let file_rel = format!("{machine_rel}/{CONFIG_FILE_NAME}");
        let file_abs = self.machine_dir(&config.name).join(CONFIG_FILE_NAME);
        dir.write(&file_rel, rendered).map_err(|err| StoreError::Io {
            path: file_abs.clone(),
            message: err.to_string(),
        })?;
        Ok(file_abs)
    }

    /// Loads the named machine's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingMachine`] when no configuration was ever
    /// saved, and [`StoreError::Parse`] when the file does not deserialise.
    pub fn load_config(&self, name: &str) -> Result<MachineConfig, StoreError> {
        let dir = self.open_root()?;
        let file_rel = format!("machines/{name}/{CONFIG_FILE_NAME}");
        let file_abs = self.machine_dir(name).join(CONFIG_FILE_NAME);
        let contents = match dir.read_to_string(&file_rel) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::MissingMachine {
                    name: name.to_owned(),
                });
            }
            Err(err) => {
                return Err(StoreError::Io {
                    path: file_abs,
                    message: err.to_string(),
                });
            }
        };
        serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
            path: file_abs,
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::driver::MachineConfig;

    fn store(dir: &TempDir) -> MachineStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
        MachineStore::new(root)
    }

    fn config(root: &Utf8Path) -> MachineConfig {
        MachineConfig::builder()
            .name("devbox")
            .store_path(root)
            .boot_image_url("https://example.invalid/boot.iso")
            .cpu_count(1)
            .memory_mb(2048)
            .disk_size_mb(20_000)
            .network_name("kvm-machines")
            .cache_mode("threads")
            .build()
            .unwrap_or_else(|err| panic!("{err}"))
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let machine_store = store(&tmp);
        let saved = config(machine_store.root());

        let path = machine_store
            .save_config(&saved)
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(path.as_str().ends_with("machines/devbox/config.json"));

        let loaded = machine_store
            .load_config("devbox")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(loaded, saved);
    }

    #[test]
    fn load_reports_machines_that_were_never_created() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let machine_store = store(&tmp);

        let result = machine_store.load_config("ghost");
        assert!(
            matches!(result, Err(StoreError::MissingMachine { ref name }) if name == "ghost"),
            "unexpected result: {result:?}"
        );
    }
}
