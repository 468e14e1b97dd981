//! Idempotent virtual network management.
//!
//! Machines need their networks defined, autostarted, and active before the
//! domain starts. Restarting an existing machine hits the
//! already-defined-and-active path, which must not error.

use crate::hypervisor::{Hypervisor, HypervisorError};

/// Ensures the named network exists, is flagged for autostart, and is
/// active.
///
/// Looks the network up by name; defines it from `xml` only when absent.
/// Autostart is set on every call. An already-active network is left alone.
///
/// # Errors
///
/// Returns [`HypervisorError`] when defining, flagging, or activating the
/// network fails.
pub fn ensure<H: Hypervisor>(
    hypervisor: &H,
    name: &str,
    xml: &str,
) -> Result<(), HypervisorError> {
    let active = match hypervisor.network_is_active(name) {
        Ok(active) => active,
        Err(err) if err.is_not_found() => {
            tracing::info!(network = name, "defining network");
            hypervisor.define_network(xml)?;
            false
        }
        Err(err) => return Err(err),
    };

    hypervisor.set_network_autostart(name, true)?;

    if active {
        tracing::debug!(network = name, "network already active");
    } else {
        tracing::info!(network = name, "activating network");
        hypervisor.activate_network(name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHypervisor;
    use crate::xml;

    #[test]
    fn ensure_defines_missing_networks() {
        let fake = FakeHypervisor::new();
        ensure(&fake, "kvm-machines", &xml::private_network("kvm-machines"))
            .unwrap_or_else(|err| panic!("{err}"));

        assert!(fake
            .network_is_active("kvm-machines")
            .unwrap_or_else(|err| panic!("{err}")));
        assert!(fake.network_autostart("kvm-machines"));
    }

    #[test]
    fn ensure_is_idempotent() {
        let fake = FakeHypervisor::new();
        let rendered = xml::private_network("kvm-machines");

        ensure(&fake, "kvm-machines", &rendered).unwrap_or_else(|err| panic!("{err}"));
        let defines_after_first = fake.calls_matching("define_network");

        ensure(&fake, "kvm-machines", &rendered)
            .unwrap_or_else(|err| panic!("second ensure must not error: {err}"));

        assert_eq!(
            fake.calls_matching("define_network"),
            defines_after_first,
            "second ensure must not redefine the network"
        );
        assert!(fake
            .network_is_active("kvm-machines")
            .unwrap_or_else(|err| panic!("{err}")));
    }

    #[test]
    fn ensure_activates_inactive_networks() {
        let fake = FakeHypervisor::new();
        fake.seed_network("default", false, false);

        ensure(&fake, "default", &xml::default_network())
            .unwrap_or_else(|err| panic!("{err}"));

        assert!(fake
            .network_is_active("default")
            .unwrap_or_else(|err| panic!("{err}")));
        assert!(fake.network_autostart("default"));
        assert_eq!(
            fake.calls_matching("define_network"),
            0,
            "existing network must not be redefined"
        );
    }
}
