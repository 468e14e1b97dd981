//! Start, stop, restart, and kill.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::time::sleep;

use crate::driver::MachineState;
use crate::hypervisor::Hypervisor;

use super::{IP_POLL_ATTEMPTS, KvmDriver, KvmDriverError, STOP_POLL_ATTEMPTS, SshProbe};

impl<H: Hypervisor, P: SshProbe> KvmDriver<H, P> {
    /// Powers the machine on, waits for its address, then blocks until SSH
    /// answers.
    ///
    /// After an initial settle delay the address poll runs a bounded number
    /// of attempts; a discovery error mid-poll clears the cached address and
    /// counts as "try again". The SSH wait is unbounded: boot readiness is
    /// coupled to guest SSH readiness.
    pub(super) async fn run_start(&mut self) -> Result<(), KvmDriverError> {
        tracing::debug!(machine = %self.config.name, "powering on domain");
        self.hypervisor
            .start_domain(&self.config.name)
            .map_err(|err| KvmDriverError::hypervisor("starting domain", err))?;

        sleep(self.boot_settle_delay).await;
        let ip = self.wait_for_ip().await?;
        self.wait_for_ssh(ip).await;
        Ok(())
    }

    async fn wait_for_ip(&mut self) -> Result<Ipv4Addr, KvmDriverError> {
        for attempt in 0..IP_POLL_ATTEMPTS {
            match self.poll_ip() {
                Ok(Some(ip)) => {
                    tracing::debug!(%ip, "found IP for machine");
                    self.runtime.ip_address = Some(ip);
                    return Ok(ip);
                }
                Ok(None) => {
                    tracing::debug!(attempt, total = IP_POLL_ATTEMPTS, "waiting for machine to come up");
                }
                Err(err) => {
                    self.runtime.ip_address = None;
                    tracing::debug!(%err, attempt, "address lookup failed, retrying");
                }
            }
            sleep(self.ip_poll_interval).await;
        }
        Err(KvmDriverError::NoAddressAfterTimeout {
            attempts: IP_POLL_ATTEMPTS,
        })
    }

    pub(super) async fn wait_for_ssh(&self, ip: Ipv4Addr) {
        let addr = SocketAddr::from((ip, self.runtime.ssh_port));
        loop {
            if self.probe.probe(addr).await {
                tracing::debug!(%addr, "ssh is reachable");
                return;
            }
            tracing::debug!(%addr, "waiting for ssh");
            sleep(self.ssh_retry_interval).await;
        }
    }

    /// Gracefully stops the machine.
    ///
    /// The cached address is cleared first so stale reads fail closed. An
    /// already-stopped machine is a success without a shutdown request;
    /// otherwise the state is polled a bounded number of times and
    /// exhaustion reports the last observed state.
    pub(super) async fn run_stop(&mut self) -> Result<(), KvmDriverError> {
        self.runtime.ip_address = None;

        let mut last_state = self.query_state()?;
        if last_state == MachineState::Stopped {
            tracing::debug!("machine already stopped");
            return Ok(());
        }

        self.hypervisor
            .shutdown_domain(&self.config.name)
            .map_err(|err| KvmDriverError::hypervisor("stopping domain", err))?;

        for attempt in 0..STOP_POLL_ATTEMPTS {
            last_state = self.query_state()?;
            if last_state == MachineState::Stopped {
                return Ok(());
            }
            tracing::info!(attempt, total = STOP_POLL_ATTEMPTS, "waiting for machine to stop");
            sleep(self.stop_poll_interval).await;
        }
        Err(KvmDriverError::StopTimeout {
            attempts: STOP_POLL_ATTEMPTS,
            last_state,
        })
    }

    /// Forcibly powers the machine off regardless of state, without polling.
    pub(super) fn run_kill(&self) -> Result<(), KvmDriverError> {
        tracing::debug!(machine = %self.config.name, "destroying domain");
        self.hypervisor
            .destroy_domain(&self.config.name)
            .map_err(|err| KvmDriverError::hypervisor("killing domain", err))
    }
}
