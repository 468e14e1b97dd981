//! Command-line interface definitions for the `kvm-machine` binary.
//!
//! This module centralises the clap parser structures so both the main
//! binary and the build script can reuse them when generating the manual
//! page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `kvm-machine` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kvm-machine",
    about = "Manage KVM virtual machines for host provisioning",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a new machine and start it.
    #[command(name = "create", about = "Provision a new machine and start it")]
    Create(CreateCommand),
    /// Power a machine on and wait until it is reachable.
    #[command(name = "start", about = "Power a machine on and wait for SSH")]
    Start(MachineCommand),
    /// Gracefully stop a machine.
    #[command(name = "stop", about = "Gracefully stop a machine")]
    Stop(MachineCommand),
    /// Stop, then start a machine.
    #[command(name = "restart", about = "Stop, then start a machine")]
    Restart(MachineCommand),
    /// Forcibly power a machine off.
    #[command(name = "kill", about = "Forcibly power a machine off")]
    Kill(MachineCommand),
    /// Tear a machine's resources down.
    #[command(name = "rm", about = "Tear a machine's resources down")]
    Remove(MachineCommand),
    /// Print a machine's state.
    #[command(name = "status", about = "Print a machine's state")]
    Status(MachineCommand),
    /// Print a machine's discovered address.
    #[command(name = "ip", about = "Print a machine's discovered address")]
    Ip(MachineCommand),
    /// Print a machine's remote management URL.
    #[command(name = "url", about = "Print a machine's remote management URL")]
    Url(MachineCommand),
    /// Check hypervisor reachability and print its version.
    #[command(name = "check", about = "Check hypervisor reachability")]
    Check,
}

/// Arguments shared by subcommands operating on an existing machine.
#[derive(Debug, Parser)]
pub(crate) struct MachineCommand {
    /// Machine name.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
    /// Override the store root directory.
    #[arg(long, value_name = "PATH")]
    pub(crate) store: Option<Utf8PathBuf>,
}

/// Arguments for the `kvm-machine create` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CreateCommand {
    /// Machine name and store selection.
    #[command(flatten)]
    pub(crate) machine: MachineCommand,
    /// Override the number of virtual CPUs for this machine.
    #[arg(long, value_name = "COUNT")]
    pub(crate) cpu_count: Option<u32>,
    /// Override the memory size in megabytes for this machine.
    #[arg(long, value_name = "MB")]
    pub(crate) memory_mb: Option<u32>,
    /// Override the disk size in megabytes for this machine.
    #[arg(long, value_name = "MB")]
    pub(crate) disk_size_mb: Option<u64>,
    /// Override the private network this machine joins.
    #[arg(long, value_name = "NETWORK")]
    pub(crate) network: Option<String>,
    /// Override the boot image source for this machine.
    #[arg(long, value_name = "URL")]
    pub(crate) boot_image: Option<String>,
}
