use std::fmt;
use serde::{Serialize, Deserialize};

/// One reachable backend process, parsed from a registry value of the form `address:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Address to connect to in order to reach the instance
    pub address: String,

    /// Port to connect to in order to reach the instance
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Canonical key used for ordering and fingerprinting: `address:port`
    pub fn full_key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// All instances that receive traffic on one externally exposed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_port: u16,

    /// Accumulation order from the registry read; made deterministic by [`canonicalize`]
    pub instances: Vec<ServiceInstance>,
}

impl ServiceRegistration {
    pub fn new(service_port: u16, instances: Vec<ServiceInstance>) -> Self {
        Self {
            service_port,
            instances,
        }
    }

    /// Canonical key: `port-[k1,k2,...]` with instance keys sorted, independent of
    /// the order of `instances`.
    pub fn full_key(&self) -> String {
        let mut keys: Vec<String> = self.instances.iter().map(ServiceInstance::full_key).collect();
        keys.sort();
        format!("{}-[{}]", self.service_port, keys.join(","))
    }
}

/// A point-in-time snapshot of the whole routing table.
/// This is the unit of comparison between reconciliation cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistrations(pub Vec<ServiceRegistration>);

impl ServiceRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ServiceRegistration> {
        self.0.iter()
    }

    /// Total number of instances across all registrations
    pub fn instance_count(&self) -> usize {
        self.0.iter().map(|sr| sr.instances.len()).sum()
    }
}

impl FromIterator<ServiceRegistration> for ServiceRegistrations {
    fn from_iter<I: IntoIterator<Item = ServiceRegistration>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ServiceRegistrations {
    type Item = ServiceRegistration;
    type IntoIter = std::vec::IntoIter<ServiceRegistration>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ServiceRegistrations {
    type Item = &'a ServiceRegistration;
    type IntoIter = std::slice::Iter<'a, ServiceRegistration>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Sorts instances within each registration by their full key, then the
/// registrations themselves by their full key. Both sorts are stable and
/// compare the keys as plain strings.
pub fn canonicalize(snapshot: ServiceRegistrations) -> ServiceRegistrations {
    let mut list = snapshot.0;
    for sr in &mut list {
        sr.instances.sort_by_cached_key(ServiceInstance::full_key);
    }
    list.sort_by_cached_key(ServiceRegistration::full_key);
    ServiceRegistrations(list)
}

/// Canonical string form of a snapshot. Two snapshots describe the same routing
/// table iff their fingerprints are byte-equal.
pub fn fingerprint(snapshot: &ServiceRegistrations) -> String {
    let mut keys: Vec<String> = snapshot.iter().map(ServiceRegistration::full_key).collect();
    keys.sort();
    format!("[{}]", keys.join(","))
}
