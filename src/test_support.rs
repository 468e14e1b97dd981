//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use crate::hypervisor::{Hypervisor, HypervisorError, PowerState, ResourceKind};
use crate::kvm::SshProbe;
use crate::xml::DEFAULT_POOL_NAME;

/// In-memory hypervisor double.
///
/// Keeps a small simulated inventory of domains, networks, pools, and
/// volumes so the common paths behave like the real thing, and accepts
/// scripted results for the queries lifecycle tests need to steer
/// (power-state polls, interface-address lookups, injected failures).
/// Cloning shares the underlying state, so tests keep a handle for
/// assertions after moving a clone into the driver.
#[derive(Clone, Debug, Default)]
pub struct FakeHypervisor {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    version: u64,
    calls: Vec<String>,
    networks: BTreeMap<String, NetworkRecord>,
    domains: BTreeMap<String, DomainRecord>,
    pools: BTreeSet<String>,
    volumes: BTreeMap<String, VolumeRecord>,
    power_results: VecDeque<Result<PowerState, HypervisorError>>,
    interface_results: VecDeque<Result<Vec<String>, HypervisorError>>,
    failures: BTreeMap<&'static str, VecDeque<HypervisorError>>,
}

impl Default for Inner {
    fn default() -> Self {
        let mut pools = BTreeSet::new();
        pools.insert(DEFAULT_POOL_NAME.to_owned());
        Self {
            version: 5_000_000,
            calls: Vec::new(),
            networks: BTreeMap::new(),
            domains: BTreeMap::new(),
            pools,
            volumes: BTreeMap::new(),
            power_results: VecDeque::new(),
            interface_results: VecDeque::new(),
            failures: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct NetworkRecord {
    active: bool,
    autostart: bool,
}

#[derive(Debug)]
struct DomainRecord {
    xml: String,
    running: bool,
}

#[derive(Debug)]
struct VolumeRecord {
    pool: String,
    payload: Option<Vec<u8>>,
}

impl FakeHypervisor {
    /// Creates a fake with the `default` storage pool present and a modern
    /// library version.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overrides the reported library version.
    pub fn set_version(&self, version: u64) {
        self.lock().version = version;
    }

    /// Seeds a network record without going through `define_network`.
    pub fn seed_network(&self, name: &str, active: bool, autostart: bool) {
        self.lock()
            .networks
            .insert(name.to_owned(), NetworkRecord { active, autostart });
    }

    /// Seeds a defined domain without going through `define_domain`.
    pub fn seed_domain(&self, name: &str, running: bool) {
        self.lock().domains.insert(
            name.to_owned(),
            DomainRecord {
                xml: String::new(),
                running,
            },
        );
    }

    /// Seeds a volume in the named pool.
    pub fn seed_volume(&self, pool: &str, name: &str) {
        self.lock().volumes.insert(
            name.to_owned(),
            VolumeRecord {
                pool: pool.to_owned(),
                payload: None,
            },
        );
    }

    /// Removes a storage pool, making subsequent volume calls miss.
    pub fn remove_pool(&self, name: &str) {
        self.lock().pools.remove(name);
    }

    /// Queues a scripted result for the next `domain_power_state` call.
    pub fn push_power_state(&self, result: Result<PowerState, HypervisorError>) {
        self.lock().power_results.push_back(result);
    }

    /// Queues a scripted result for the next `domain_interface_addresses`
    /// call.
    pub fn push_interface_addresses(&self, result: Result<Vec<String>, HypervisorError>) {
        self.lock().interface_results.push_back(result);
    }

    /// Queues a failure returned by the next call to the named operation.
    pub fn fail_on(&self, operation: &'static str, error: HypervisorError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Returns the recorded call log.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Counts recorded calls whose entry starts with `prefix`.
    #[must_use]
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Reports whether the named network is flagged for autostart.
    #[must_use]
    pub fn network_autostart(&self, name: &str) -> bool {
        self.lock()
            .networks
            .get(name)
            .is_some_and(|network| network.autostart)
    }

    /// Reports whether a domain definition exists for `name`.
    #[must_use]
    pub fn domain_defined(&self, name: &str) -> bool {
        self.lock().domains.contains_key(name)
    }

    /// Returns the XML the named domain was defined from, if any.
    #[must_use]
    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.lock()
            .domains
            .get(name)
            .map(|domain| domain.xml.clone())
    }

    /// Returns the payload last uploaded to the named volume.
    #[must_use]
    pub fn volume_payload(&self, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .volumes
            .get(name)
            .and_then(|volume| volume.payload.clone())
    }

    /// Reports whether the named volume still exists.
    #[must_use]
    pub fn volume_exists(&self, name: &str) -> bool {
        self.lock().volumes.contains_key(name)
    }

    /// Reports whether the named network still exists.
    #[must_use]
    pub fn network_defined(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }

    fn record(&self, operation: &'static str, detail: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.calls.push(format!("{operation} {detail}"));
        if let Some(queue) = inner.failures.get_mut(operation) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }
}

fn extract_name(xml: &str) -> String {
    let start = xml.find("<name>").map(|index| index + "<name>".len());
    let end = xml.find("</name>");
    match (start, end) {
        (Some(from), Some(to)) if from <= to => {
            xml.get(from..to).unwrap_or_default().trim().to_owned()
        }
        _ => String::new(),
    }
}

fn missing(kind: ResourceKind, name: &str) -> HypervisorError {
    HypervisorError::NotFound {
        kind,
        name: name.to_owned(),
    }
}

impl Hypervisor for FakeHypervisor {
    fn library_version(&self) -> Result<u64, HypervisorError> {
        self.record("library_version", "")?;
        Ok(self.lock().version)
    }

    fn define_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        let name = extract_name(xml);
        self.record("define_domain", &name)?;
        self.lock().domains.insert(
            name,
            DomainRecord {
                xml: xml.to_owned(),
                running: false,
            },
        );
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("undefine_domain", name)?;
        self.lock()
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing(ResourceKind::Domain, name))
    }

    fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("start_domain", name)?;
        let mut inner = self.lock();
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| missing(ResourceKind::Domain, name))?;
        domain.running = true;
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("shutdown_domain", name)?;
        let mut inner = self.lock();
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| missing(ResourceKind::Domain, name))?;
        domain.running = false;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("destroy_domain", name)?;
        let mut inner = self.lock();
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| missing(ResourceKind::Domain, name))?;
        domain.running = false;
        Ok(())
    }

    fn domain_power_state(&self, name: &str) -> Result<PowerState, HypervisorError> {
        self.record("domain_power_state", name)?;
        let mut inner = self.lock();
        if let Some(result) = inner.power_results.pop_front() {
            return result;
        }
        inner.domains.get(name).map_or_else(
            || Err(missing(ResourceKind::Domain, name)),
            |domain| {
                Ok(if domain.running {
                    PowerState::Running
                } else {
                    PowerState::Shutoff
                })
            },
        )
    }

    fn domain_interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        self.record("domain_interface_addresses", name)?;
        self.lock()
            .interface_results
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn network_is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        self.record("network_is_active", name)?;
        self.lock().networks.get(name).map_or_else(
            || Err(missing(ResourceKind::Network, name)),
            |network| Ok(network.active),
        )
    }

    fn define_network(&self, xml: &str) -> Result<(), HypervisorError> {
        let name = extract_name(xml);
        self.record("define_network", &name)?;
        self.lock().networks.insert(
            name,
            NetworkRecord {
                active: false,
                autostart: false,
            },
        );
        Ok(())
    }

    fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<(), HypervisorError> {
        self.record("set_network_autostart", name)?;
        let mut inner = self.lock();
        let network = inner
            .networks
            .get_mut(name)
            .ok_or_else(|| missing(ResourceKind::Network, name))?;
        network.autostart = autostart;
        Ok(())
    }

    fn activate_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("activate_network", name)?;
        let mut inner = self.lock();
        let network = inner
            .networks
            .get_mut(name)
            .ok_or_else(|| missing(ResourceKind::Network, name))?;
        network.active = true;
        Ok(())
    }

    fn destroy_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("destroy_network", name)?;
        let mut inner = self.lock();
        let network = inner
            .networks
            .get_mut(name)
            .ok_or_else(|| missing(ResourceKind::Network, name))?;
        network.active = false;
        Ok(())
    }

    fn undefine_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("undefine_network", name)?;
        self.lock()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing(ResourceKind::Network, name))
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<(), HypervisorError> {
        let name = extract_name(xml);
        self.record("create_volume", &name)?;
        let mut inner = self.lock();
        if !inner.pools.contains(pool) {
            return Err(missing(ResourceKind::StoragePool, pool));
        }
        inner.volumes.insert(
            name,
            VolumeRecord {
                pool: pool.to_owned(),
                payload: None,
            },
        );
        Ok(())
    }

    fn upload_volume(
        &self,
        pool: &str,
        volume: &str,
        payload: &[u8],
    ) -> Result<(), HypervisorError> {
        self.record("upload_volume", volume)?;
        let mut inner = self.lock();
        if !inner.pools.contains(pool) {
            return Err(missing(ResourceKind::StoragePool, pool));
        }
        let record = inner
            .volumes
            .get_mut(volume)
            .ok_or_else(|| missing(ResourceKind::StorageVolume, volume))?;
        record.payload = Some(payload.to_vec());
        Ok(())
    }

    fn delete_volume(&self, pool: &str, volume: &str) -> Result<(), HypervisorError> {
        self.record("delete_volume", volume)?;
        let mut inner = self.lock();
        if !inner.pools.contains(pool) {
            return Err(missing(ResourceKind::StoragePool, pool));
        }
        match inner.volumes.get(volume) {
            Some(record) if record.pool == pool => {
                inner.volumes.remove(volume);
                Ok(())
            }
            _ => Err(missing(ResourceKind::StorageVolume, volume)),
        }
    }
}

/// SSH probe double returning scripted outcomes in FIFO order, then a fixed
/// default.
#[derive(Clone, Debug)]
pub struct ScriptedProbe {
    outcomes: Arc<Mutex<VecDeque<bool>>>,
    fallback: bool,
    attempts: Arc<Mutex<usize>>,
}

impl ScriptedProbe {
    /// Creates a probe that reports `fallback` once the scripted outcomes
    /// run out.
    #[must_use]
    pub fn always(fallback: bool) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            attempts: Arc::new(Mutex::new(0)),
        }
    }

    /// Queues the next probe outcome.
    pub fn push(&self, outcome: bool) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    /// Number of probes performed so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SshProbe for ScriptedProbe {
    fn probe<'a>(&'a self, _addr: SocketAddr) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            *self
                .attempts
                .lock()
                .unwrap_or_else(PoisonError::into_inner) += 1;
            self.outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or(self.fallback)
        })
    }
}
