//! The multi-step create sequence.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::hypervisor::Hypervisor;
use crate::xml::{DEFAULT_NETWORK_NAME, DEFAULT_POOL_NAME};
use crate::{bundle, image, network, xml};

use super::{KvmDriver, KvmDriverError, SshProbe};

impl<H: Hypervisor, P: SshProbe> KvmDriver<H, P> {
    /// Provisions the machine's resources, then starts it.
    ///
    /// Steps, in order: stage the boot image, ensure the default and private
    /// networks, prepare the machine directory, allocate the storage volume
    /// and inject the cert bundle at offset zero, define the domain, start.
    /// A failing step aborts the sequence; partially created resources are
    /// left for `remove` to clean up.
    pub(super) async fn run_create(&mut self) -> Result<(), KvmDriverError> {
        tracing::info!(machine = %self.config.name, "creating machine");

        image::stage(&self.config.boot_image_url, &self.config.iso_path).await?;

        network::ensure(&self.hypervisor, DEFAULT_NETWORK_NAME, &xml::default_network())
            .map_err(|err| KvmDriverError::hypervisor("ensuring default network", err))?;
        network::ensure(
            &self.hypervisor,
            &self.config.network_name,
            &xml::private_network(&self.config.network_name),
        )
        .map_err(|err| KvmDriverError::hypervisor("ensuring private network", err))?;

        self.prepare_machine_dir()?;

        self.hypervisor
            .create_volume(DEFAULT_POOL_NAME, &xml::volume(&self.config))
            .map_err(|err| KvmDriverError::hypervisor("creating storage volume", err))?;
        let payload = bundle::build(&self.config.ssh_key_path)?;
        self.hypervisor
            .upload_volume(DEFAULT_POOL_NAME, &self.config.volume_name(), &payload)
            .map_err(|err| KvmDriverError::hypervisor("writing cert bundle", err))?;

        self.hypervisor
            .define_domain(&xml::domain(&self.config))
            .map_err(|err| KvmDriverError::hypervisor("defining domain", err))?;

        tracing::debug!("finished create, starting machine");
        self.run_start().await
    }

    /// Creates the machine directory tree and repairs missing traversal
    /// bits on every ancestor so the hypervisor process, running as a
    /// different user, can reach the staged files.
    fn prepare_machine_dir(&self) -> Result<(), KvmDriverError> {
        let dir = self.config.machine_dir();
        fs::create_dir_all(&dir).map_err(|err| KvmDriverError::MachineDir {
            path: dir.clone(),
            message: err.to_string(),
        })?;
        repair_traversal_bits(&dir)
    }
}

fn repair_traversal_bits(start: &Utf8Path) -> Result<(), KvmDriverError> {
    let mut dir: Utf8PathBuf = start.to_owned();
    while dir.as_str() != "/" {
        let metadata = fs::metadata(&dir).map_err(|err| KvmDriverError::MachineDir {
            path: dir.clone(),
            message: err.to_string(),
        })?;
        let mut mode = metadata.permissions().mode();
        if mode & 0o001 == 0 {
            tracing::debug!(path = %dir, "setting traversal bit");
            mode |= 0o001;
            // Chmod on ancestors the invoking user does not own is expected
            // to fail; the domain will surface the real problem if access is
            // actually missing.
            if let Err(err) = fs::set_permissions(&dir, fs::Permissions::from_mode(mode)) {
                tracing::warn!(path = %dir, %err, "could not set traversal bit");
            }
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_owned(),
            None => break,
        }
    }
    Ok(())
}
