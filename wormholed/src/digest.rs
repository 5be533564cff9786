use sha2::{Sha256, Digest};
use shared::types::{fingerprint, ServiceRegistrations};

/// Length of the digest prefix used in log lines
const SHORT_LEN: usize = 12;

/// Computes a SHA-256 hash of a snapshot's fingerprint.
/// Equal for any two snapshots that describe the same routing table.
pub fn compute_hash(services: &ServiceRegistrations) -> String {
    let hash = Sha256::digest(fingerprint(services).as_bytes());
    hex::encode(hash)
}

/// Abbreviated hash for log output
pub fn short(hash: &str) -> &str {
    hash.get(..SHORT_LEN).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{ServiceInstance, ServiceRegistration};

    fn registration(port: u16, addresses: &[&str]) -> ServiceRegistration {
        ServiceRegistration::new(
            port,
            addresses.iter().map(|a| ServiceInstance::new(*a, 8080)).collect(),
        )
    }

    #[test]
    fn test_hash_deterministic() {
        let a = ServiceRegistrations(vec![registration(80, &["10.0.0.1", "10.0.0.2"]), registration(81, &[])]);
        let b = ServiceRegistrations(vec![registration(81, &[]), registration(80, &["10.0.0.2", "10.0.0.1"])]);

        assert_eq!(compute_hash(&a), compute_hash(&b), "Hash should be same regardless of input order");
        assert_eq!(compute_hash(&a).len(), 64);
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let a = ServiceRegistrations(vec![registration(80, &["10.0.0.1"])]);
        let b = ServiceRegistrations(vec![registration(80, &["10.0.0.9"])]);
        assert_ne!(compute_hash(&a), compute_hash(&b), "Hash should change when an instance changes");
    }

    #[test]
    fn test_short() {
        let hash = compute_hash(&ServiceRegistrations::new());
        assert_eq!(short(&hash).len(), SHORT_LEN);
        assert_eq!(short("abc"), "abc");
    }
}
