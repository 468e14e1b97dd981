//! End-to-end driver behaviour against the scripted hypervisor fake.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use kvm_machine::bundle::BOOT_MAGIC;
use kvm_machine::driver::{MachineConfig, MachineDriver, MachineState};
use kvm_machine::hypervisor::Hypervisor;
use kvm_machine::kvm::KvmDriver;
use kvm_machine::test_support::{FakeHypervisor, ScriptedProbe};

fn store_root(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()))
}

fn fresh_config(store: &Utf8Path) -> MachineConfig {
    std::fs::write(store.join("source.iso"), b"boot-image-bytes")
        .unwrap_or_else(|err| panic!("{err}"));
    MachineConfig::builder()
        .name("devbox")
        .store_path(store)
        .boot_image_url(store.join("source.iso"))
        .cpu_count(1)
        .memory_mb(2048)
        .disk_size_mb(20_000)
        .network_name("kvm-machines")
        .cache_mode("threads")
        .build()
        .unwrap_or_else(|err| panic!("{err}"))
}

fn driver(
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

#[tokio::test]
async fn create_provisions_a_fresh_machine_end_to_end() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let config = fresh_config(&store);
    let fake = FakeHypervisor::new();
    fake.push_interface_addresses(Ok(Vec::new()));
    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.55")]));
    let probe = ScriptedProbe::always(true);
    let mut machine = driver(&fake, &probe, config.clone(), &store);

    machine
        .create()
        .await
        .unwrap_or_else(|err| panic!("create failed: {err}"));

    // Image staged into the machine directory.
    assert!(config.iso_path.exists());

    // Both networks ensured, autostarted, and active.
    for network in ["default", "kvm-machines"] {
        assert!(
            fake.network_is_active(network)
                .unwrap_or_else(|err| panic!("{err}")),
            "{network} must be active"
        );
        assert!(fake.network_autostart(network));
    }

    // The volume carries the cert bundle at offset zero: a tar stream whose
    // first header names the sentinel.
    let payload = fake
        .volume_payload("devbox-pool0-vol0")
        .unwrap_or_else(|| panic!("volume payload missing"));
    assert!(payload.starts_with(BOOT_MAGIC.as_bytes()));

    // The defined domain reproduces the configured fields.
    let domain_xml = fake
        .domain_xml("devbox")
        .unwrap_or_else(|| panic!("domain not defined"));
    assert!(domain_xml.contains("<memory unit='MB'>2048</memory>"));
    assert!(domain_xml.contains("<vcpu>1</vcpu>"));
    assert!(domain_xml.contains("<source network='kvm-machines'/>"));

    // Final state is running with a cached address.
    let state = machine
        .state()
        .await
        .unwrap_or_else(|err| panic!("state failed: {err}"));
    assert_eq!(state, MachineState::Running);
    assert_eq!(
        machine.cached_ip().map(|ip| ip.to_string()),
        Some(String::from("192.168.39.55"))
    );
}

#[tokio::test]
async fn lifecycle_runs_create_stop_start_remove() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let config = fresh_config(&store);
    let fake = FakeHypervisor::new();
    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.55")]));
    let probe = ScriptedProbe::always(true);
    let mut machine = driver(&fake, &probe, config, &store);

    machine
        .create()
        .await
        .unwrap_or_else(|err| panic!("create failed: {err}"));

    machine
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop failed: {err}"));
    assert_eq!(machine.cached_ip(), None);
    let stopped = machine
        .state()
        .await
        .unwrap_or_else(|err| panic!("state failed: {err}"));
    assert_eq!(stopped, MachineState::Stopped);

    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.56")]));
    machine
        .start()
        .await
        .unwrap_or_else(|err| panic!("start failed: {err}"));
    assert_eq!(
        machine.cached_ip().map(|ip| ip.to_string()),
        Some(String::from("192.168.39.56"))
    );

    machine
        .remove()
        .await
        .unwrap_or_else(|err| panic!("remove failed: {err}"));
    let after = machine
        .state()
        .await
        .unwrap_or_else(|err| panic!("state failed: {err}"));
    assert_eq!(after, MachineState::Undefined);
    assert!(!fake.volume_exists("devbox-pool0-vol0"));
    assert!(!fake.network_defined("kvm-machines"));
}
