//! Rendering of hypervisor definition documents.
//!
//! Pure functions from [`MachineConfig`] to the XML the hypervisor consumes
//! for domains, storage volumes, and networks. The field layout is fixed by
//! the hypervisor's schema; every configured value is substituted verbatim.

use crate::driver::MachineConfig;

/// Name of the shared NAT network every machine's first interface joins.
pub const DEFAULT_NETWORK_NAME: &str = "default";

/// Name of the storage pool machine volumes are allocated in.
pub const DEFAULT_POOL_NAME: &str = "default";

/// Gateway address of the private machine network.
pub const PRIVATE_GATEWAY: &str = "192.168.39.1";

/// Netmask of the private machine network.
pub const PRIVATE_NETMASK: &str = "255.255.255.0";

/// First address handed out on the private machine network.
pub const PRIVATE_DHCP_START: &str = "192.168.39.2";

/// Last address handed out on the private machine network.
pub const PRIVATE_DHCP_END: &str = "192.168.39.254";

/// Gateway address of the shared default network.
pub const DEFAULT_GATEWAY: &str = "192.168.122.1";

/// UUID assigned when the shared default network has to be created from
/// scratch.
pub const DEFAULT_NETWORK_UUID: &str = "dd8fe884-6c02-601e-7551-cca97df1c5df";

/// MAC address assigned when the shared default network has to be created
/// from scratch.
pub const DEFAULT_NETWORK_MAC: &str = "52:54:00:10:56:14";

/// Owner and group identifier for allocated volumes (the qemu user).
pub const VOLUME_OWNER: u32 = 107;

/// Renders the compute domain definition.
///
/// Boot order is cdrom-then-disk: the staged boot image on the CD-ROM
/// device, the machine's raw disk behind it, and two network interfaces
/// (the shared default network first, the private network second).
#[must_use]
pub fn domain(config: &MachineConfig) -> String {
    format!(
        r"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MB'>{memory}</memory>
  <vcpu>{cpu}</vcpu>
  <features>
    <acpi/>
    <apic/>
    <pae/>
  </features>
  <os>
    <type>hvm</type>
    <boot dev='cdrom'/>
    <boot dev='hd'/>
    <bootmenu enable='no'/>
  </os>
  <devices>
    <disk type='file' device='cdrom'>
      <source file='{iso}'/>
      <target dev='hdc' bus='ide'/>
      <readonly/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw' cache='{cache}' io='threads'/>
      <source file='{disk}'/>
      <target dev='hda' bus='ide'/>
    </disk>
    <interface type='network'>
      <source network='{default_net}'/>
    </interface>
    <interface type='network'>
      <source network='{network}'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target port='0'/>
    </console>
  </devices>
</domain>
",
        name = config.name,
        memory = config.memory_mb,
        cpu = config.cpu_count,
        iso = config.iso_path,
        cache = config.cache_mode,
        disk = config.disk_path,
        default_net = DEFAULT_NETWORK_NAME,
        network = config.network_name,
    )
}

/// Renders the storage volume definition for the machine's disk.
#[must_use]
pub fn volume(config: &MachineConfig) -> String {
    format!(
        r"<volume>
  <name>{name}</name>
  <capacity unit='MB'>{capacity}</capacity>
  <target>
    <format type='raw'/>
    <permissions>
      <owner>{owner}</owner>
      <group>{owner}</group>
      <mode>0644</mode>
    </permissions>
  </target>
</volume>
",
        name = config.volume_name(),
        capacity = config.disk_size_mb,
        owner = VOLUME_OWNER,
    )
}

/// Renders the private machine network definition with its fixed DHCP range.
#[must_use]
pub fn private_network(name: &str) -> String {
    format!(
        r"<network>
  <name>{name}</name>
  <ip address='{gateway}' netmask='{netmask}'>
    <dhcp>
      <range start='{start}' end='{end}'/>
    </dhcp>
  </ip>
</network>
",
        gateway = PRIVATE_GATEWAY,
        netmask = PRIVATE_NETMASK,
        start = PRIVATE_DHCP_START,
        end = PRIVATE_DHCP_END,
    )
}

/// Renders the shared default NAT network definition, used only when a host
/// has no default network at all.
#[must_use]
pub fn default_network() -> String {
    format!(
        r"<network>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <forward mode='nat'/>
  <bridge name='virbr0' stp='on' delay='0'/>
  <mac address='{mac}'/>
  <ip address='{gateway}' netmask='255.255.255.0'>
    <dhcp>
      <range start='192.168.122.2' end='192.168.122.254'/>
    </dhcp>
  </ip>
</network>
",
        name = DEFAULT_NETWORK_NAME,
        uuid = DEFAULT_NETWORK_UUID,
        mac = DEFAULT_NETWORK_MAC,
        gateway = DEFAULT_GATEWAY,
    )
}
