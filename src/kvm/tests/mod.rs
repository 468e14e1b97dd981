//! Unit tests for the lifecycle state machine, driven by scripted fakes.

mod power;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::driver::MachineConfig;
use crate::test_support::{FakeHypervisor, ScriptedProbe};

use super::KvmDriver;

fn store_root(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()))
}

fn machine_config(store: &Utf8Path) -> MachineConfig {
    machine_config_on_network(store, "kvm-machines")
}

fn machine_config_on_network(store: &Utf8Path, network: &str) -> MachineConfig {
    MachineConfig::builder()
        .name("devbox")
        .store_path(store)
        .boot_image_url(store.join("source.iso"))
        .cpu_count(1)
        .memory_mb(2048)
        .disk_size_mb(20_000)
        .network_name(network)
        .cache_mode("threads")
        .build()
        .unwrap_or_else(|err| panic!("{err}"))
}

fn seed_boot_image(store: &Utf8Path) {
    std::fs::write(store.join("source.iso"), b"boot-image-bytes")
        .unwrap_or_else(|err| panic!("{err}"));
}

/// Driver wired to fakes with all poll delays compressed for tests.
fn fast_driver(
    fake: &FakeHypervisor,
    probe: &ScriptedProbe,
    config: MachineConfig,
    store: &Utf8Path,
) -> KvmDriver<FakeHypervisor, ScriptedProbe> {
    KvmDriver::with_probe(fake.clone(), config, probe.clone())
        .with_boot_settle_delay(Duration::ZERO)
        .with_ip_poll_interval(Duration::from_millis(1))
        .with_stop_poll_interval(Duration::from_millis(1))
        .with_ssh_retry_interval(Duration::from_millis(1))
        .with_lease_dir(store)
}
