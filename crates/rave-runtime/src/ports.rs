use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;

use rave_core::{Error, Result};
use tracing::warn;

/// How far past the preferred port the allocator scans before giving up.
const SCAN_RANGE: u16 = 100;

/// Guest-side targets for the standard forwards.
pub const GUEST_HTTP_PORT: u16 = 80;
pub const GUEST_HTTPS_PORT: u16 = 443;
pub const GUEST_SSH_PORT: u16 = 22;
pub const GUEST_TEST_PORT: u16 = 8080;

/// Data-plane service forwarding (guest side).
pub const DATA_PLANE_GUEST_PORTS: [(&str, u16); 2] = [("postgres", 5432), ("redis", 6379)];

/// Preferred host ports for data-plane services.
pub const DATA_PLANE_PORT_DEFAULTS: [(&str, u16); 2] = [("postgres", 25432), ("redis", 26379)];

/// Check whether a host TCP port can be bound for forwarding.
/// The bind is transient; the listener is dropped immediately.
pub fn host_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Allocate one host port per logical name, preferring the requested port
/// and scanning upward when it is taken.
///
/// The returned map never contains duplicate ports: a port claimed for an
/// earlier name is excluded from later probes even though it is still
/// bindable. Allocation order follows the input slice, so results are
/// deterministic when every preferred port is free.
pub fn allocate(preferred: &[(&str, u16)]) -> Result<BTreeMap<String, u16>> {
    let mut assigned = BTreeMap::new();
    let mut taken = BTreeSet::new();

    for (name, want) in preferred {
        let port = find_available(*want, &taken)?;
        if port != *want {
            warn!(
                service = name,
                preferred = want,
                using = port,
                "preferred port unavailable"
            );
        }
        taken.insert(port);
        assigned.insert(name.to_string(), port);
    }

    Ok(assigned)
}

fn find_available(start: u16, taken: &BTreeSet<u16>) -> Result<u16> {
    for offset in 0..=SCAN_RANGE {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if !taken.contains(&port) && host_port_available(port) {
            return Ok(port);
        }
    }
    Err(Error::resource(format!(
        "no free port in range {start}-{}",
        start.saturating_add(SCAN_RANGE)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_available_detects_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!host_port_available(port));
        drop(listener);
        assert!(host_port_available(port));
    }

    #[test]
    fn test_allocate_prefers_free_ports_deterministically() {
        // High ephemeral-range ports that are very unlikely to be bound.
        let prefs = [("http", 49381), ("https", 49382), ("ssh", 49383)];
        let a = allocate(&prefs).unwrap();
        let b = allocate(&prefs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["http"], 49381);
    }

    #[test]
    fn test_allocate_skips_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let prefs = [("svc", port)];
        let assigned = allocate(&prefs).unwrap();
        assert_ne!(assigned["svc"], port);
        assert!(assigned["svc"] > port);
    }

    #[test]
    fn test_allocate_never_duplicates() {
        // Two services preferring the same port must get distinct results.
        let prefs = [("a", 49400), ("b", 49400), ("c", 49400)];
        let assigned = allocate(&prefs).unwrap();
        let values: BTreeSet<u16> = assigned.values().copied().collect();
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_allocation_failure_is_resource_error() {
        // Port 65535 with everything above it out of range and the port
        // itself claimed forces exhaustion quickly.
        let mut taken = BTreeSet::new();
        for p in 65435..=65535u16 {
            taken.insert(p);
        }
        let err = find_available(65435, &taken).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }
}
