//! KVM implementation of the machine driver contract.
//!
//! [`KvmDriver`] owns the lifecycle state machine: the multi-step create
//! sequence, the bounded polling loops around start and stop, and the
//! best-effort teardown. All hypervisor access goes through the
//! [`Hypervisor`] seam; SSH reachability goes through the [`SshProbe`] seam
//! so tests can script both.

mod create;
mod error;
mod power;
mod remove;
#[cfg(test)]
mod tests;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::discovery;
use crate::driver::{DriverFuture, MachineConfig, MachineDriver, MachineState};
use crate::hypervisor::Hypervisor;

pub use error::KvmDriverError;
pub use remove::{TeardownOutcome, TeardownReport};

/// TCP port of the remote management endpoint composed into URLs.
pub const REMOTE_API_PORT: u16 = 2376;

/// User account the guest image accepts SSH logins for.
pub const SSH_USERNAME: &str = "docker";

/// TCP port the guest serves SSH on.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Attempts the start sequence polls for an address before giving up.
pub const IP_POLL_ATTEMPTS: u32 = 40;

/// Attempts the stop sequence polls for the stopped state before giving up.
pub const STOP_POLL_ATTEMPTS: u32 = 60;

const BOOT_SETTLE_DELAY: Duration = Duration::from_secs(5);
const IP_POLL_INTERVAL: Duration = Duration::from_secs(3);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SSH_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Reachability probe for the guest's SSH endpoint.
pub trait SshProbe {
    /// Returns `true` when a connection to `addr` succeeds.
    fn probe<'a>(&'a self, addr: SocketAddr) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Probe that attempts a TCP connection with a short timeout.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpProbe;

impl SshProbe for TcpProbe {
    fn probe<'a>(&'a self, addr: SocketAddr) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            matches!(
                timeout(SSH_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )
        })
    }
}

/// Mutable per-driver runtime state, owned by the state machine.
///
/// The cached address is set by a successful start, cleared by stop and by
/// discovery errors mid-poll; it never lives on the machine configuration.
#[derive(Clone, Copy, Debug)]
struct RuntimeState {
    ip_address: Option<Ipv4Addr>,
    ssh_port: u16,
}

/// Machine driver for KVM over a hypervisor seam.
#[derive(Debug)]
pub struct KvmDriver<H, P = TcpProbe> {
    hypervisor: H,
    probe: P,
    config: MachineConfig,
    runtime: RuntimeState,
    boot_settle_delay: Duration,
    ip_poll_interval: Duration,
    stop_poll_interval: Duration,
    ssh_retry_interval: Duration,
    lease_dir: Utf8PathBuf,
}

impl<H: Hypervisor> KvmDriver<H> {
    /// Creates a driver probing SSH over TCP.
    #[must_use]
    pub fn new(hypervisor: H, config: MachineConfig) -> Self {
        Self::with_probe(hypervisor, config, TcpProbe)
    }
}

impl<H: Hypervisor, P: SshProbe> KvmDriver<H, P> {
    /// Creates a driver with an explicit SSH probe.
    #[must_use]
    pub fn with_probe(hypervisor: H, config: MachineConfig, probe: P) -> Self {
        Self {
            hypervisor,
            probe,
            config,
            runtime: RuntimeState {
                ip_address: None,
                ssh_port: DEFAULT_SSH_PORT,
            },
            boot_settle_delay: BOOT_SETTLE_DELAY,
            ip_poll_interval: IP_POLL_INTERVAL,
            stop_poll_interval: STOP_POLL_INTERVAL,
            ssh_retry_interval: SSH_RETRY_INTERVAL,
            lease_dir: Utf8PathBuf::from(discovery::LEASE_DIR),
        }
    }

    /// Overrides the post-power-on settle delay.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_boot_settle_delay(mut self, delay: Duration) -> Self {
        self.boot_settle_delay = delay;
        self
    }

    /// Overrides the address poll interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_ip_poll_interval(mut self, interval: Duration) -> Self {
        self.ip_poll_interval = interval;
        self
    }

    /// Overrides the stop poll interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    /// Overrides the SSH retry interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_ssh_retry_interval(mut self, interval: Duration) -> Self {
        self.ssh_retry_interval = interval;
        self
    }

    /// Overrides the directory scanned for legacy lease files.
    #[must_use]
    pub fn with_lease_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.lease_dir = dir.into();
        self
    }

    /// The address cached by the last successful start, if any.
    #[must_use]
    pub const fn cached_ip(&self) -> Option<Ipv4Addr> {
        self.runtime.ip_address
    }

    /// Maps the hypervisor's reported power state to the driver-level state.
    ///
    /// A missing domain reports [`MachineState::Undefined`], the terminal
    /// state of a fully torn-down machine.
    fn query_state(&self) -> Result<MachineState, KvmDriverError> {
        match self.hypervisor.domain_power_state(&self.config.name) {
            Ok(power) => Ok(MachineState::from(power)),
            Err(err) if err.is_not_found() => Ok(MachineState::Undefined),
            Err(err) => Err(KvmDriverError::hypervisor("getting domain state", err)),
        }
    }

    /// Discovers the machine's address, requiring the running state first.
    fn poll_ip(&self) -> Result<Option<Ipv4Addr>, KvmDriverError> {
        if self.query_state()? != MachineState::Running {
            return Err(KvmDriverError::NotRunning);
        }
        discovery::lookup(
            &self.hypervisor,
            &self.config.name,
            &self.config.network_name,
            &self.lease_dir,
        )
        .map_err(KvmDriverError::from)
    }

    fn query_ip(&self) -> Result<Ipv4Addr, KvmDriverError> {
        self.poll_ip()?.ok_or(KvmDriverError::AddressUnassigned)
    }

    fn run_pre_command_check(&self) -> Result<(), KvmDriverError> {
        let version = self
            .hypervisor
            .library_version()
            .map_err(|err| KvmDriverError::hypervisor("connecting to hypervisor", err))?;
        tracing::debug!(version, "using libvirt");
        Ok(())
    }

    async fn run_url(&self) -> Result<String, KvmDriverError> {
        self.run_pre_command_check()?;
        let ip = self.query_ip()?;
        self.wait_for_ssh(ip).await;
        Ok(format!("tcp://{ip}:{REMOTE_API_PORT}"))
    }
}

impl<H, P> MachineDriver for KvmDriver<H, P>
where
    H: Hypervisor + Send + Sync,
    P: SshProbe + Send + Sync,
{
    type Error = KvmDriverError;

    fn driver_name(&self) -> &'static str {
        "kvm"
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn create(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move { self.run_create().await })
    }

    fn start(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move { self.run_start().await })
    }

    fn stop(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move { self.run_stop().await })
    }

    fn restart(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move {
            self.run_stop().await?;
            self.run_start().await
        })
    }

    fn kill(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move { self.run_kill() })
    }

    fn remove(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move { self.run_remove().map(|_| ()) })
    }

    fn state(&self) -> DriverFuture<'_, MachineState, Self::Error> {
        Box::pin(async move { self.query_state() })
    }

    fn ip(&self) -> DriverFuture<'_, Ipv4Addr, Self::Error> {
        Box::pin(async move { self.query_ip() })
    }

    fn url(&self) -> DriverFuture<'_, String, Self::Error> {
        Box::pin(async move { self.run_url().await })
    }

    fn pre_command_check(&self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(async move { self.run_pre_command_check() })
    }

    fn ssh_hostname(&self) -> DriverFuture<'_, Ipv4Addr, Self::Error> {
        Box::pin(async move { self.query_ip() })
    }

    fn ssh_username(&self) -> &str {
        SSH_USERNAME
    }

    fn ssh_key_path(&self) -> &Utf8Path {
        &self.config.ssh_key_path
    }

    fn ssh_port(&self) -> u16 {
        self.runtime.ssh_port
    }
}
