//! Discovery of a running machine's IPv4 address.
//!
//! Two strategies, selected per call by a hypervisor capability probe: a
//! modern interface-address query through the hypervisor seam, and a legacy
//! scan of the dnsmasq lease file the hypervisor maintains on disk. An empty
//! result is the normal "no lease yet" outcome, not a failure; callers run
//! their own retry loop.

use std::io::ErrorKind;
use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::hypervisor::{Hypervisor, HypervisorError};

/// Directory the hypervisor's dnsmasq helper writes lease files into.
pub const LEASE_DIR: &str = "/var/lib/libvirt/dnsmasq";

/// First library version whose interface-address query is trusted; older
/// hypervisors go straight to the lease file.
pub const INTERFACE_ADDRESS_MIN_VERSION: u64 = 1_002_014;

/// Errors raised during IP discovery.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiscoveryError {
    /// Raised when the hypervisor query fails hard.
    #[error("querying hypervisor for addresses: {0}")]
    Hypervisor(#[from] HypervisorError),
    /// Raised when the lease file exists but cannot be read.
    #[error("reading lease file {path}: {message}")]
    LeaseRead {
        /// Lease file path.
        path: Utf8PathBuf,
        /// Underlying failure.
        message: String,
    },
    /// Raised when a lease line does not have exactly five fields.
    #[error("malformed lease entry at {path}:{line}: expected 5 fields, found {fields}")]
    LeaseParse {
        /// Lease file path.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
        /// Number of fields found.
        fields: usize,
    },
    /// Raised when a matching lease carries an unparseable address.
    #[error("lease entry at {path}:{line} has invalid IPv4 address '{address}'")]
    LeaseAddress {
        /// Lease file path.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
        /// Address field content.
        address: String,
    },
}

/// Looks up the machine's address, selecting the strategy by capability.
///
/// Hypervisors at or above [`INTERFACE_ADDRESS_MIN_VERSION`] are asked for
/// the domain's interface addresses; the first IPv4 entry wins. A typed
/// unsupported signal from that call falls back to the lease file within the
/// same lookup. Older hypervisors use the lease file directly. Never blocks.
///
/// # Errors
///
/// Returns [`DiscoveryError`] on hard hypervisor or parse failures; an
/// address that simply has not been assigned yet is `Ok(None)`.
pub fn lookup<H: Hypervisor>(
    hypervisor: &H,
    machine: &str,
    network: &str,
    lease_dir: &Utf8Path,
) -> Result<Option<Ipv4Addr>, DiscoveryError> {
    let version = hypervisor.library_version()?;
    if version >= INTERFACE_ADDRESS_MIN_VERSION {
        match hypervisor.domain_interface_addresses(machine) {
            Ok(addresses) => return Ok(first_ipv4(&addresses)),
            Err(err) if err.is_unsupported() => {
                tracing::debug!(%err, "falling back to lease file scan");
            }
            Err(err) => return Err(err.into()),
        }
    }
    lease_file_lookup(machine, &lease_dir.join(format!("{network}.leases")))
}

fn first_ipv4(addresses: &[String]) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .find_map(|address| address.parse::<Ipv4Addr>().ok())
}

/// Scans the dnsmasq lease file at `path` for the machine's lease.
///
/// Each line holds five space-separated fields: expiry timestamp, MAC,
/// address, hostname, extended MAC. The lease whose hostname equals the
/// machine name wins; with several matches the last one in file order does.
/// A missing lease file means no lease has been recorded yet.
///
/// # Errors
///
/// Returns [`DiscoveryError::LeaseParse`] for lines with a field count other
/// than five, and [`DiscoveryError::LeaseRead`] when the file cannot be
/// read.
pub fn lease_file_lookup(
    machine: &str,
    path: &Utf8Path,
) -> Result<Option<Ipv4Addr>, DiscoveryError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path, "no lease file yet");
            return Ok(None);
        }
        Err(err) => {
            return Err(DiscoveryError::LeaseRead {
                path: path.to_owned(),
                message: err.to_string(),
            });
        }
    };
    parse_leases(&contents, machine, path)
}

fn parse_leases(
    contents: &str,
    machine: &str,
    path: &Utf8Path,
) -> Result<Option<Ipv4Addr>, DiscoveryError> {
    let mut found = None;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [_expiry, _mac, address, hostname, _client_id] = fields.as_slice() else {
            return Err(DiscoveryError::LeaseParse {
                path: path.to_owned(),
                line: index + 1,
                fields: fields.len(),
            });
        };
        if *hostname != machine {
            continue;
        }
        let parsed = address
            .parse::<Ipv4Addr>()
            .map_err(|_| DiscoveryError::LeaseAddress {
                path: path.to_owned(),
                line: index + 1,
                address: (*address).to_owned(),
            })?;
        found = Some(parsed);
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::hypervisor::HypervisorError;
    use crate::test_support::FakeHypervisor;

    fn lease_dir(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()))
    }

    fn write_leases(dir: &Utf8Path, network: &str, contents: &str) {
        std::fs::write(dir.join(format!("{network}.leases")), contents)
            .unwrap_or_else(|err| panic!("{err}"));
    }

    const WELL_FORMED: &str = "\
1500000000 52:54:00:aa:bb:01 192.168.39.10 other-machine 01:52:54:00:aa:bb:01
1500000100 52:54:00:aa:bb:02 192.168.39.11 devbox 01:52:54:00:aa:bb:02
1500000200 52:54:00:aa:bb:03 192.168.39.12 third-machine 01:52:54:00:aa:bb:03
";

    #[test]
    fn lease_lookup_returns_matching_hostname() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);
        write_leases(&dir, "kvm-machines", WELL_FORMED);

        let found = lease_file_lookup("devbox", &dir.join("kvm-machines.leases"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, Some(Ipv4Addr::new(192, 168, 39, 11)));
    }

    #[test]
    fn lease_lookup_without_match_is_empty_not_an_error() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);
        write_leases(&dir, "kvm-machines", WELL_FORMED);

        let found = lease_file_lookup("absent", &dir.join("kvm-machines.leases"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, None);
    }

    #[test]
    fn lease_lookup_prefers_the_last_match_in_file_order() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);
        write_leases(
            &dir,
            "kvm-machines",
            "\
1500000000 52:54:00:aa:bb:01 192.168.39.10 devbox 01:52:54:00:aa:bb:01
1400000000 52:54:00:aa:bb:02 192.168.39.20 devbox 01:52:54:00:aa:bb:02
",
        );

        let found = lease_file_lookup("devbox", &dir.join("kvm-machines.leases"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(
            found,
            Some(Ipv4Addr::new(192, 168, 39, 20)),
            "file order decides, not expiry"
        );
    }

    #[rstest]
    #[case("1500000000 52:54:00:aa:bb:01 192.168.39.10 devbox\n", 4)]
    #[case("1500000000 52:54:00:aa:bb:01 192.168.39.10 devbox extra trailing\n", 6)]
    fn lease_lookup_rejects_malformed_lines(#[case] contents: &str, #[case] fields: usize) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);
        write_leases(&dir, "kvm-machines", contents);

        let result = lease_file_lookup("devbox", &dir.join("kvm-machines.leases"));
        assert_eq!(
            result,
            Err(DiscoveryError::LeaseParse {
                path: dir.join("kvm-machines.leases"),
                line: 1,
                fields,
            })
        );
    }

    #[test]
    fn lease_lookup_missing_file_means_no_lease_yet() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);

        let found = lease_file_lookup("devbox", &dir.join("kvm-machines.leases"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, None);
    }

    #[test]
    fn modern_lookup_takes_the_first_ipv4_address() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let fake = FakeHypervisor::new();
        fake.push_interface_addresses(Ok(vec![
            String::from("fe80::1"),
            String::from("192.168.39.42"),
            String::from("192.168.39.99"),
        ]));

        let found = lookup(&fake, "devbox", "kvm-machines", &lease_dir(&tmp))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, Some(Ipv4Addr::new(192, 168, 39, 42)));
    }

    #[test]
    fn modern_lookup_with_no_addresses_is_empty() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let fake = FakeHypervisor::new();
        fake.push_interface_addresses(Ok(Vec::new()));

        let found = lookup(&fake, "devbox", "kvm-machines", &lease_dir(&tmp))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, None);
    }

    #[test]
    fn unsupported_signal_falls_back_to_the_lease_file() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);
        write_leases(&dir, "kvm-machines", WELL_FORMED);

        let fake = FakeHypervisor::new();
        fake.push_interface_addresses(Err(HypervisorError::Unsupported {
            operation: "querying interface addresses",
        }));

        let found = lookup(&fake, "devbox", "kvm-machines", &dir)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, Some(Ipv4Addr::new(192, 168, 39, 11)));
    }

    #[test]
    fn old_hypervisors_skip_the_modern_path_entirely() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let dir = lease_dir(&tmp);
        write_leases(&dir, "kvm-machines", WELL_FORMED);

        let fake = FakeHypervisor::new();
        fake.set_version(1_002_002);

        let found = lookup(&fake, "devbox", "kvm-machines", &dir)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(found, Some(Ipv4Addr::new(192, 168, 39, 11)));
        assert_eq!(
            fake.calls_matching("domain_interface_addresses"),
            0,
            "old hypervisors must not be queried for interface addresses"
        );
    }

    #[test]
    fn hard_hypervisor_failures_propagate() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("{err}"));
        let fake = FakeHypervisor::new();
        fake.push_interface_addresses(Err(HypervisorError::Api {
            operation: "querying interface addresses",
            message: String::from("boom"),
        }));

        let result = lookup(&fake, "devbox", "kvm-machines", &lease_dir(&tmp));
        assert!(
            matches!(result, Err(DiscoveryError::Hypervisor(_))),
            "unexpected result: {result:?}"
        );
    }
}
