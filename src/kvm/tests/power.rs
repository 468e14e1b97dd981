use std::net::Ipv4Addr;

use tempfile::TempDir;

use crate::driver::{MachineDriver, MachineState};
use crate::hypervisor::{HypervisorError, PowerState};
use crate::kvm::{IP_POLL_ATTEMPTS, KvmDriverError, REMOTE_API_PORT, STOP_POLL_ATTEMPTS};
use crate::test_support::{FakeHypervisor, ScriptedProbe};

use super::{fast_driver, machine_config, store_root};

#[tokio::test]
async fn start_caches_the_address_once_discovery_reports_one() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", false);
    fake.push_interface_addresses(Ok(Vec::new()));
    fake.push_interface_addresses(Ok(Vec::new()));
    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.42")]));
    let probe = ScriptedProbe::always(true);
    // First handshake attempt fails; start must retry until it succeeds.
    probe.push(false);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    driver
        .start()
        .await
        .unwrap_or_else(|err| panic!("start failed: {err}"));

    assert_eq!(driver.cached_ip(), Some(Ipv4Addr::new(192, 168, 39, 42)));
    assert_eq!(fake.calls_matching("start_domain"), 1);
    assert!(
        probe.attempts() >= 2,
        "ssh wait must retry after a failed handshake"
    );
}

#[tokio::test]
async fn start_fails_with_timeout_when_no_address_ever_appears() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", false);
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    let result = driver.start().await;

    assert!(
        matches!(
            result,
            Err(KvmDriverError::NoAddressAfterTimeout {
                attempts: IP_POLL_ATTEMPTS
            })
        ),
        "unexpected result: {result:?}"
    );
    assert_eq!(driver.cached_ip(), None, "timeout must leave no cached ip");
    assert_eq!(probe.attempts(), 0, "ssh must not be probed without an ip");
}

#[tokio::test]
async fn start_treats_discovery_errors_as_retries() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", false);
    fake.push_interface_addresses(Err(HypervisorError::Api {
        operation: "querying interface addresses",
        message: String::from("transient"),
    }));
    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.7")]));
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    driver
        .start()
        .await
        .unwrap_or_else(|err| panic!("start failed: {err}"));

    assert_eq!(driver.cached_ip(), Some(Ipv4Addr::new(192, 168, 39, 7)));
}

#[tokio::test]
async fn stop_succeeds_immediately_when_already_stopped() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", false);
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    driver
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop failed: {err}"));

    assert_eq!(
        fake.calls_matching("shutdown_domain"),
        0,
        "no shutdown request for an already-stopped machine"
    );
}

#[tokio::test]
async fn stop_polls_until_the_machine_reports_stopped() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", true);
    // Pre-check sees running, then the guest takes two polls to wind down.
    fake.push_power_state(Ok(PowerState::Running));
    fake.push_power_state(Ok(PowerState::Running));
    fake.push_power_state(Ok(PowerState::Shutdown));
    fake.push_power_state(Ok(PowerState::Shutoff));
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    driver
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop failed: {err}"));

    assert_eq!(fake.calls_matching("shutdown_domain"), 1);
}

#[tokio::test]
async fn stop_reports_the_last_observed_state_after_exhaustion() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", true);
    for _ in 0..=STOP_POLL_ATTEMPTS {
        fake.push_power_state(Ok(PowerState::Running));
    }
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    let result = driver.stop().await;

    assert!(
        matches!(
            result,
            Err(KvmDriverError::StopTimeout {
                attempts: STOP_POLL_ATTEMPTS,
                last_state: MachineState::Running,
            })
        ),
        "unexpected result: {result:?}"
    );
}

#[tokio::test]
async fn stop_clears_the_cached_address() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", false);
    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.42")]));
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    driver
        .start()
        .await
        .unwrap_or_else(|err| panic!("start failed: {err}"));
    assert!(driver.cached_ip().is_some());

    driver
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop failed: {err}"));
    assert_eq!(driver.cached_ip(), None);
}

#[tokio::test]
async fn restart_aborts_when_stop_fails() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", true);
    fake.push_power_state(Err(HypervisorError::Api {
        operation: "querying domain state",
        message: String::from("boom"),
    }));
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    let result = driver.restart().await;

    assert!(
        matches!(result, Err(KvmDriverError::Hypervisor { .. })),
        "unexpected result: {result:?}"
    );
    assert_eq!(
        fake.calls_matching("start_domain"),
        0,
        "start must not run after a failed stop"
    );
}

#[tokio::test]
async fn kill_destroys_without_polling() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", true);
    let probe = ScriptedProbe::always(true);
    let mut driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    driver
        .kill()
        .await
        .unwrap_or_else(|err| panic!("kill failed: {err}"));

    assert_eq!(fake.calls_matching("destroy_domain"), 1);
    assert_eq!(
        fake.calls_matching("domain_power_state"),
        0,
        "kill must not poll state"
    );
}

#[tokio::test]
async fn ip_requires_the_running_state() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", false);
    let probe = ScriptedProbe::always(true);
    let driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    let result = driver.ip().await;
    assert!(
        matches!(result, Err(KvmDriverError::NotRunning)),
        "unexpected result: {result:?}"
    );
}

#[tokio::test]
async fn url_composes_host_and_management_port() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    fake.seed_domain("devbox", true);
    fake.push_interface_addresses(Ok(vec![String::from("192.168.39.42")]));
    let probe = ScriptedProbe::always(true);
    let driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    let url = driver
        .url()
        .await
        .unwrap_or_else(|err| panic!("url failed: {err}"));

    assert_eq!(url, format!("tcp://192.168.39.42:{REMOTE_API_PORT}"));
}

#[tokio::test]
async fn state_reports_undefined_for_missing_domains() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
    let store = store_root(&tmp);
    let fake = FakeHypervisor::new();
    let probe = ScriptedProbe::always(true);
    let driver = fast_driver(&fake, &probe, machine_config(&store), &store);

    let state = driver
        .state()
        .await
        .unwrap_or_else(|err| panic!("state failed: {err}"));
    assert_eq!(state, MachineState::Undefined);
}
