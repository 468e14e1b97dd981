//! Libvirt implementation of the hypervisor seam.
//!
//! Every call opens its own connection to the management endpoint and
//! releases it before returning; the `virt` handle types free their
//! underlying references on drop, so error paths release everything they
//! acquired.

use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use crate::hypervisor::{Hypervisor, HypervisorError, PowerState, ResourceKind};

/// URI of the system-level QEMU/KVM management endpoint.
pub const QEMU_SYSTEM_URI: &str = "qemu:///system";

/// Hypervisor seam backed by a local libvirt daemon.
#[derive(Clone, Debug)]
pub struct LibvirtHypervisor {
    uri: String,
}

impl LibvirtHypervisor {
    /// Connects to the system QEMU/KVM endpoint.
    #[must_use]
    pub fn system() -> Self {
        Self::new(QEMU_SYSTEM_URI)
    }

    /// Connects to an explicit libvirt URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    fn connect(&self) -> Result<Connection, HypervisorError> {
        Connection::open(&self.uri)
    }
}

/// Scoped libvirt connection, closed when the operation's scope ends.
struct Connection {
    inner: Connect,
}

impl Connection {
    fn open(uri: &str) -> Result<Self, HypervisorError> {
        Connect::open(Some(uri))
            .map(|inner| Self { inner })
            .map_err(|err| HypervisorError::Connection {
                message: err.to_string(),
            })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.inner.close() {
            tracing::warn!(%err, "closing libvirt connection");
        }
    }
}

fn api_error(operation: &'static str, err: &virt::error::Error) -> HypervisorError {
    if err.code() == virt::error::ErrorNumber::NoSupport {
        HypervisorError::Unsupported { operation }
    } else {
        HypervisorError::Api {
            operation,
            message: err.to_string(),
        }
    }
}

fn not_found(kind: ResourceKind, name: &str) -> HypervisorError {
    HypervisorError::NotFound {
        kind,
        name: name.to_owned(),
    }
}

fn lookup_domain(conn: &Connect, name: &str) -> Result<Domain, HypervisorError> {
    Domain::lookup_by_name(conn, name).map_err(|_| not_found(ResourceKind::Domain, name))
}

fn lookup_network(conn: &Connect, name: &str) -> Result<Network, HypervisorError> {
    Network::lookup_by_name(conn, name).map_err(|_| not_found(ResourceKind::Network, name))
}

fn lookup_pool(conn: &Connect, name: &str) -> Result<StoragePool, HypervisorError> {
    StoragePool::lookup_by_name(conn, name).map_err(|_| not_found(ResourceKind::StoragePool, name))
}

const fn map_power_state(state: sys::virDomainState) -> PowerState {
    match state {
        sys::VIR_DOMAIN_NOSTATE => PowerState::NoState,
        sys::VIR_DOMAIN_RUNNING => PowerState::Running,
        sys::VIR_DOMAIN_BLOCKED => PowerState::Blocked,
        sys::VIR_DOMAIN_PAUSED => PowerState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => PowerState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => PowerState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => PowerState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => PowerState::Suspended,
        _ => PowerState::Unknown,
    }
}

fn send_all(stream: &Stream, payload: &[u8]) -> Result<(), HypervisorError> {
    let mut remaining = payload;
    while !remaining.is_empty() {
        let sent = stream
            .send(remaining)
            .map_err(|err| api_error("uploading cert bundle", &err))?;
        remaining = remaining.get(sent..).unwrap_or_default();
    }
    Ok(())
}

impl Hypervisor for LibvirtHypervisor {
    fn library_version(&self) -> Result<u64, HypervisorError> {
        let conn = self.connect()?;
        conn.inner
            .get_lib_version()
            .map(|version| version.into())
            .map_err(|err| api_error("getting libvirt version", &err))
    }

    fn define_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let _domain = Domain::define_xml(&conn.inner, xml)
            .map_err(|err| api_error("defining domain", &err))?;
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let domain = lookup_domain(&conn.inner, name)?;
        domain
            .undefine()
            .map_err(|err| api_error("undefining domain", &err))
    }

    fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let domain = lookup_domain(&conn.inner, name)?;
        domain
            .create()
            .map(|_| ())
            .map_err(|err| api_error("starting domain", &err))
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let domain = lookup_domain(&conn.inner, name)?;
        domain
            .shutdown()
            .map(|_| ())
            .map_err(|err| api_error("shutting down domain", &err))
    }

    fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let domain = lookup_domain(&conn.inner, name)?;
        domain
            .destroy()
            .map_err(|err| api_error("destroying domain", &err))
    }

    fn domain_power_state(&self, name: &str) -> Result<PowerState, HypervisorError> {
        let conn = self.connect()?;
        let domain = lookup_domain(&conn.inner, name)?;
        let (state, _reason) = domain
            .get_state()
            .map_err(|err| api_error("getting domain state", &err))?;
        Ok(map_power_state(state))
    }

    fn domain_interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        let conn = self.connect()?;
        let domain = lookup_domain(&conn.inner, name)?;
        let interfaces = domain
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(|err| api_error("querying interface addresses", &err))?;
        Ok(interfaces
            .into_iter()
            .flat_map(|interface| interface.addrs.into_iter().map(|address| address.addr))
            .collect())
    }

    fn network_is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        let conn = self.connect()?;
        let network = lookup_network(&conn.inner, name)?;
        network
            .is_active()
            .map_err(|err| api_error("querying network state", &err))
    }

    fn define_network(&self, xml: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let _network = Network::define_xml(&conn.inner, xml)
            .map_err(|err| api_error("defining network", &err))?;
        Ok(())
    }

    fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let network = lookup_network(&conn.inner, name)?;
        network
            .set_autostart(autostart)
            .map(|_| ())
            .map_err(|err| api_error("setting network autostart", &err))
    }

    fn activate_network(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let network = lookup_network(&conn.inner, name)?;
        network
            .create()
            .map(|_| ())
            .map_err(|err| api_error("activating network", &err))
    }

    fn destroy_network(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let network = lookup_network(&conn.inner, name)?;
        network
            .destroy()
            .map_err(|err| api_error("destroying network", &err))
    }

    fn undefine_network(&self, name: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let network = lookup_network(&conn.inner, name)?;
        network
            .undefine()
            .map_err(|err| api_error("undefining network", &err))
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let pool_handle = lookup_pool(&conn.inner, pool)?;
        let _volume = StorageVol::create_xml(&pool_handle, xml, 0)
            .map_err(|err| api_error("creating storage volume", &err))?;
        Ok(())
    }

    fn upload_volume(
        &self,
        pool: &str,
        volume: &str,
        payload: &[u8],
    ) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let pool_handle = lookup_pool(&conn.inner, pool)?;
        let volume_handle = StorageVol::lookup_by_name(&pool_handle, volume)
            .map_err(|_| not_found(ResourceKind::StorageVolume, volume))?;

        let stream = Stream::new(&conn.inner, 0)
            .map_err(|err| api_error("opening upload stream", &err))?;
        volume_handle
            .upload(&stream, 0, payload.len() as u64, 0)
            .map_err(|err| api_error("uploading cert bundle", &err))?;
        // The upload length is exactly the payload length, so the transport
        // never expects trailing padding.
        if let Err(err) = send_all(&stream, payload) {
            stream.abort().ok();
            return Err(err);
        }
        stream
            .finish()
            .map_err(|err| api_error("finishing upload stream", &err))
    }

    fn delete_volume(&self, pool: &str, volume: &str) -> Result<(), HypervisorError> {
        let conn = self.connect()?;
        let pool_handle = lookup_pool(&conn.inner, pool)?;
        let volume_handle = StorageVol::lookup_by_name(&pool_handle, volume)
            .map_err(|_| not_found(ResourceKind::StorageVolume, volume))?;
        volume_handle
            .delete(0)
            .map_err(|err| api_error("deleting storage volume", &err))
    }
}
