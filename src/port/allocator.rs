//! Pure port allocation.
//!
//! The hash base makes assignments stable across invocations for the same
//! repo layout; linear probing guarantees an exhaustive search of the range.
//! The bind probe is best-effort: the TOCTOU window between probe and the
//! child's own bind is tolerated because the state lock serializes
//! allocations and a child that loses the race surfaces a bind error the
//! operator can retry.

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::net::TcpListener;

/// Choose a port for `branch`/`service`.
///
/// A configured fixed port wins outright (or fails if already taken).
/// Otherwise the base is `min + (fnv1a_32(branch ":" service) % range_size)`
/// and candidates are probed linearly with wrap-around, skipping ports in
/// `used` and ports some other process already listens on.
pub fn allocate(
    branch: &str,
    service: &str,
    svc: &ServiceConfig,
    fixed_port: Option<u16>,
    used: &HashSet<u16>,
) -> Result<u16> {
    if let Some(fixed) = fixed_port {
        if used.contains(&fixed) {
            return Err(Error::FixedPortInUse {
                port: fixed,
                branch: branch.to_string(),
                service: service.to_string(),
            });
        }
        return Ok(fixed);
    }

    let range = svc.port_range;
    let range_size = range.len();
    let base = hash_base(branch, service, range_size);

    for i in 0..range_size {
        // The offset is < range_size <= 65535, so the cast cannot truncate.
        let candidate = range.min + ((base + i) % range_size) as u16;
        if !used.contains(&candidate) && is_port_free(candidate) {
            return Ok(candidate);
        }
    }

    Err(Error::PortRangeExhausted {
        min: range.min,
        max: range.max,
        branch: branch.to_string(),
        service: service.to_string(),
    })
}

/// Offset into the range derived from FNV-1a of `branch:service`.
fn hash_base(branch: &str, service: &str, range_size: u32) -> u32 {
    let key = format!("{branch}:{service}");
    fnv1a_32(key.as_bytes()) % range_size
}

/// FNV-1a 32-bit hash. Deterministic across Rust versions and platforms,
/// which keeps port assignments stable between invocations.
fn fnv1a_32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Best-effort check that a TCP port is free, by briefly binding it on the
/// loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn svc(min: u16, max: u16) -> ServiceConfig {
        ServiceConfig {
            command: "sleep 1".to_string(),
            dir: String::new(),
            port_range: PortRange { min, max },
            proxy_port: 3000,
        }
    }

    #[test]
    fn allocation_is_deterministic() {
        let svc = svc(3100, 3199);
        let used = HashSet::new();
        let a = allocate("main", "web", &svc, None, &used).unwrap();
        let b = allocate("main", "web", &svc, None, &used).unwrap();
        assert_eq!(a, b);
        assert!((3100..=3199).contains(&a));
    }

    #[test]
    fn different_keys_usually_differ() {
        let svc = svc(3100, 3199);
        let used = HashSet::new();
        let a = allocate("main", "web", &svc, None, &used).unwrap();
        let b = allocate("feature/auth", "web", &svc, None, &used).unwrap();
        // Not guaranteed by hashing, but true for these fixtures; the
        // assertion documents the intent of hash spreading.
        assert_ne!(a, b);
    }

    #[test]
    fn probes_past_used_ports() {
        let svc = svc(3100, 3199);
        let first = allocate("main", "web", &svc, None, &HashSet::new()).unwrap();
        let used = HashSet::from([first]);
        let second = allocate("main", "web", &svc, None, &used).unwrap();
        assert_ne!(first, second);
        assert!((3100..=3199).contains(&second));
    }

    #[test]
    fn fixed_port_wins() {
        let svc = svc(3100, 3199);
        let port = allocate("main", "web", &svc, Some(3150), &HashSet::new()).unwrap();
        assert_eq!(port, 3150);
    }

    #[test]
    fn fixed_port_in_use_fails() {
        let svc = svc(3100, 3199);
        let used = HashSet::from([3150]);
        let err = allocate("main", "web", &svc, Some(3150), &used).unwrap_err();
        assert!(matches!(err, Error::FixedPortInUse { port: 3150, .. }));
    }

    #[test]
    fn size_one_range_returns_port_iff_unused() {
        // Pick a port the OS will let us bind: grab an ephemeral one first.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let svc = svc(port, port);
        assert_eq!(
            allocate("main", "web", &svc, None, &HashSet::new()).unwrap(),
            port
        );

        let used = HashSet::from([port]);
        let err = allocate("main", "web", &svc, None, &used).unwrap_err();
        assert!(matches!(err, Error::PortRangeExhausted { .. }));
    }

    #[test]
    fn exhausted_range_fails() {
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        // Keep the listener alive so the bind probe sees the port occupied.
        let svc = svc(port, port);
        let err = allocate("main", "web", &svc, None, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::PortRangeExhausted { .. }));
        drop(probe);
    }

    #[test]
    fn fnv_reference_values() {
        // Published FNV-1a 32 test vectors.
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }
}
