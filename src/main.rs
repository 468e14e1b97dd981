//! Binary entry point for the `kvm-machine` CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use kvm_machine::config::ConfigError;
use kvm_machine::kvm::KvmDriverError;
use kvm_machine::store::StoreError;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("driver error: {0}")]
    Driver(#[from] KvmDriverError),
    #[cfg(feature = "libvirt")]
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] kvm_machine::hypervisor::HypervisorError),
    #[cfg(not(feature = "libvirt"))]
    #[error("this build has no libvirt support; rebuild with the `libvirt` feature")]
    LibvirtUnavailable,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let parsed = Cli::parse();
    let exit_code = match dispatch(parsed).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(feature = "libvirt")]
mod run {
    use std::io::{self, Write};

    use kvm_machine::config::DriverConfig;
    use kvm_machine::driver::{MachineConfig, MachineDriver};
    use kvm_machine::hypervisor::Hypervisor;
    use kvm_machine::kvm::KvmDriver;
    use kvm_machine::libvirt::LibvirtHypervisor;
    use kvm_machine::store::MachineStore;

    use super::CliError;
    use crate::cli::{Cli, CreateCommand, MachineCommand};

    fn emit(line: impl std::fmt::Display) {
        writeln!(io::stdout(), "{line}").ok();
    }

    pub(super) async fn dispatch(parsed: Cli) -> Result<(), CliError> {
        match parsed {
            Cli::Create(args) => create(args).await,
            Cli::Start(args) => {
                let mut driver = load_driver(&args)?;
                driver.start().await?;
                emit(format!("machine '{}' is running", args.name));
                Ok(())
            }
            Cli::Stop(args) => {
                let mut driver = load_driver(&args)?;
                driver.stop().await?;
                emit(format!("machine '{}' stopped", args.name));
                Ok(())
            }
            Cli::Restart(args) => {
                let mut driver = load_driver(&args)?;
                driver.restart().await?;
                emit(format!("machine '{}' restarted", args.name));
                Ok(())
            }
            Cli::Kill(args) => {
                let mut driver = load_driver(&args)?;
                driver.kill().await?;
                Ok(())
            }
            Cli::Remove(args) => {
                let mut driver = load_driver(&args)?;
                driver.remove().await?;
                emit(format!("machine '{}' removed", args.name));
                Ok(())
            }
            Cli::Status(args) => {
                let driver = load_driver(&args)?;
                let state = driver.state().await?;
                emit(state);
                Ok(())
            }
            Cli::Ip(args) => {
                let driver = load_driver(&args)?;
                let ip = driver.ip().await?;
                emit(ip);
                Ok(())
            }
            Cli::Url(args) => {
                let driver = load_driver(&args)?;
                let url = driver.url().await?;
                emit(url);
                Ok(())
            }
            Cli::Check => check(),
        }
    }

    async fn create(args: CreateCommand) -> Result<(), CliError> {
        let config = DriverConfig::load_without_cli_args()?;
        let store_root = config.store_root(args.machine.store.clone())?;
        let store = MachineStore::new(store_root.clone());

        let mut machine = config.as_machine_config(&args.machine.name, &store_root)?;
        apply_overrides(&mut machine, &args)?;
        store.save_config(&machine)?;

        let mut driver = build_driver(machine, &config.libvirt_uri);
        driver.create().await?;
        emit(format!("machine '{}' created", args.machine.name));
        Ok(())
    }

    fn apply_overrides(machine: &mut MachineConfig, args: &CreateCommand) -> Result<(), CliError> {
        if let Some(cpu_count) = args.cpu_count {
            machine.cpu_count = cpu_count;
        }
        if let Some(memory_mb) = args.memory_mb {
            machine.memory_mb = memory_mb;
        }
        if let Some(disk_size_mb) = args.disk_size_mb {
            machine.disk_size_mb = disk_size_mb;
        }
        if let Some(network) = &args.network {
            machine.network_name = network.clone();
        }
        if let Some(boot_image) = &args.boot_image {
            machine.boot_image_url = boot_image.clone();
        }
        machine
            .validate()
            .map_err(kvm_machine::config::ConfigError::from)?;
        Ok(())
    }

    fn check() -> Result<(), CliError> {
        let config = DriverConfig::load_without_cli_args()?;
        let hypervisor = LibvirtHypervisor::new(&config.libvirt_uri);
        let version = hypervisor.library_version()?;
        emit(format!("connected to {} (libvirt {version})", config.libvirt_uri));
        Ok(())
    }

    fn load_driver(args: &MachineCommand) -> Result<KvmDriver<LibvirtHypervisor>, CliError> {
        let config = DriverConfig::load_without_cli_args()?;
        let store_root = config.store_root(args.store.clone())?;
        let store = MachineStore::new(store_root);
        let machine = store.load_config(&args.name)?;
        Ok(build_driver(machine, &config.libvirt_uri))
    }

    fn build_driver(machine: MachineConfig, uri: &str) -> KvmDriver<LibvirtHypervisor> {
        KvmDriver::new(LibvirtHypervisor::new(uri), machine)
    }
}

#[cfg(feature = "libvirt")]
use run::dispatch;

#[cfg(not(feature = "libvirt"))]
async fn dispatch(_parsed: Cli) -> Result<(), CliError> {
    Err(CliError::LibvirtUnavailable)
}
