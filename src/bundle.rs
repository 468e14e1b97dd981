//! Boot payload injected into the machine's disk before first boot.
//!
//! The guest image's init system scans the start of the disk for a tar
//! archive whose first entry is the [`BOOT_MAGIC`] sentinel; finding it, the
//! guest formats the disk and installs the bundled `authorized_keys`, which
//! is how the driver's SSH key ends up accepted by a freshly created
//! machine.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::Utf8Path;
use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use thiserror::Error;

/// Sentinel the guest scans for to decide whether to auto-configure.
///
/// Used both as the first entry's file name and as its content.
pub const BOOT_MAGIC: &str = "boot2docker, please format-me";

/// Errors raised while building the cert bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Raised when SSH key generation fails.
    #[error("generating ssh key at {path}: {message}")]
    KeyGenerate {
        /// Target path of the private key.
        path: String,
        /// Underlying failure.
        message: String,
    },
    /// Raised when the public key cannot be read back.
    #[error("reading ssh public key {path}: {message}")]
    KeyRead {
        /// Path of the public key file.
        path: String,
        /// Underlying failure.
        message: String,
    },
    /// Raised when writing an archive entry fails.
    #[error("archiving cert bundle entry '{entry}': {message}")]
    Archive {
        /// Entry being written.
        entry: &'static str,
        /// Underlying failure.
        message: String,
    },
}

/// Generates an SSH key pair at `key_path` unless one already exists.
///
/// The private key is written with mode 0600; the public key next to it with
/// a `.pub` suffix. Key generation happens once per machine, so an existing
/// key is left untouched.
///
/// # Errors
///
/// Returns [`BundleError::KeyGenerate`] when the key cannot be produced or
/// written.
pub fn generate_ssh_key(key_path: &Utf8Path) -> Result<(), BundleError> {
    if key_path.exists() {
        tracing::debug!(path = %key_path, "ssh key already present");
        return Ok(());
    }
    let fail = |message: String| BundleError::KeyGenerate {
        path: key_path.to_string(),
        message,
    };

    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent).map_err(|err| fail(err.to_string()))?;
    }

    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|err| fail(err.to_string()))?;
    let encoded = private
        .to_openssh(LineEnding::LF)
        .map_err(|err| fail(err.to_string()))?;
    fs::write(key_path, encoded.as_bytes()).map_err(|err| fail(err.to_string()))?;
    fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
        .map_err(|err| fail(err.to_string()))?;

    let public = private
        .public_key()
        .to_openssh()
        .map_err(|err| fail(err.to_string()))?;
    fs::write(format!("{key_path}.pub"), format!("{public}\n"))
        .map_err(|err| fail(err.to_string()))?;

    tracing::debug!(path = %key_path, "generated ssh key pair");
    Ok(())
}

/// Builds the cert bundle archive for the machine keyed at `key_path`.
///
/// The archive holds, in fixed order: the sentinel file (name and content
/// both [`BOOT_MAGIC`]), a `.ssh` directory entry with mode 0700, and
/// `.ssh/authorized_keys` (mode 0644) containing the public key bytes.
/// Regenerated on every create; the driver never reads it back.
///
/// # Errors
///
/// Returns [`BundleError`] when key generation, the public key read, or an
/// archive write fails.
pub fn build(key_path: &Utf8Path) -> Result<Vec<u8>, BundleError> {
    generate_ssh_key(key_path)?;

    let public_path = format!("{key_path}.pub");
    let public_key = fs::read(&public_path).map_err(|err| BundleError::KeyRead {
        path: public_path,
        message: err.to_string(),
    })?;

    let mut archive = tar::Builder::new(Vec::new());

    let mut sentinel = tar::Header::new_gnu();
    sentinel.set_mode(0o644);
    sentinel.set_size(BOOT_MAGIC.len() as u64);
    archive
        .append_data(&mut sentinel, BOOT_MAGIC, BOOT_MAGIC.as_bytes())
        .map_err(|err| archive_error("sentinel", &err))?;

    let mut ssh_dir = tar::Header::new_gnu();
    ssh_dir.set_entry_type(tar::EntryType::Directory);
    ssh_dir.set_mode(0o700);
    ssh_dir.set_size(0);
    archive
        .append_data(&mut ssh_dir, ".ssh", std::io::empty())
        .map_err(|err| archive_error(".ssh", &err))?;

    let mut authorized = tar::Header::new_gnu();
    authorized.set_mode(0o644);
    authorized.set_size(public_key.len() as u64);
    archive
        .append_data(&mut authorized, ".ssh/authorized_keys", public_key.as_slice())
        .map_err(|err| archive_error(".ssh/authorized_keys", &err))?;

    archive
        .into_inner()
        .map_err(|err| archive_error("finish", &err))
}

fn archive_error(entry: &'static str, err: &std::io::Error) -> BundleError {
    BundleError::Archive {
        entry,
        message: err.to_string(),
    }
}
