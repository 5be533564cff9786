use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use shared::protocol::{INSTANCE_ID_DELIMITER, INSTANCE_VALUE_DELIMITER, SERVICE_PORT_INDEX};
use shared::types::{ServiceInstance, ServiceRegistration, ServiceRegistrations};
use crate::registry::{Registry, RegistryError, RegistryNode};

/// Why a single registry entry was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("Instance id malformed: '{0}'")]
    MalformedKey(String),

    #[error("Invalid service port '{port}' in instance id '{id}'")]
    InvalidServicePort { id: String, port: String },

    #[error("Invalid service instance '{0}'")]
    MalformedValue(String),

    #[error("Invalid service instance port '{port}' in '{value}'")]
    InvalidInstancePort { value: String, port: String },
}

/// Extract the exposed service port from an instance id such as `host:web:80`.
pub fn parse_service_port(instance_id: &str) -> Result<u16, EntryError> {
    let parts: Vec<&str> = instance_id.split(INSTANCE_ID_DELIMITER).collect();
    if parts.len() <= SERVICE_PORT_INDEX {
        return Err(EntryError::MalformedKey(instance_id.to_string()));
    }

    let port = parts[SERVICE_PORT_INDEX];
    port.parse().map_err(|_| EntryError::InvalidServicePort {
        id: instance_id.to_string(),
        port: port.to_string(),
    })
}

/// Parse a registry value of the form `<address>:<port>`.
pub fn parse_service_instance(value: &str) -> Result<ServiceInstance, EntryError> {
    let parts: Vec<&str> = value.split(INSTANCE_VALUE_DELIMITER).collect();
    if parts.len() != 2 {
        return Err(EntryError::MalformedValue(value.to_string()));
    }

    let port = parts[1].parse().map_err(|_| EntryError::InvalidInstancePort {
        value: value.to_string(),
        port: parts[1].to_string(),
    })?;
    Ok(ServiceInstance::new(parts[0], port))
}

/// Builds complete snapshots of the registered instances below one registry key.
pub struct RegistrationReader<R: Registry> {
    registry: Arc<R>,
    key: String,
}

impl<R: Registry> RegistrationReader<R> {
    pub fn new(registry: Arc<R>, key: impl Into<String>) -> Self {
        Self {
            registry,
            key: key.into(),
        }
    }

    /// Perform a full read of the subtree.
    ///
    /// Only transport errors fail the read. Entries with a malformed key or value
    /// are logged and skipped so one bad registration cannot hide all others.
    pub async fn read(&self) -> Result<ServiceRegistrations, RegistryError> {
        let root = match self.registry.read_tree(&self.key).await? {
            Some(root) => root,
            None => {
                debug!(key = %self.key, "Registry key not found, treating as empty");
                return Ok(ServiceRegistrations::new());
            }
        };

        Ok(group_instances(&root.nodes))
    }
}

/// Parse the direct children of the watched key and group them by service port.
/// Ports keep the order in which they were first seen; instances keep read order.
fn group_instances(nodes: &[RegistryNode]) -> ServiceRegistrations {
    let mut index: HashMap<u16, usize> = HashMap::new();
    let mut list: Vec<ServiceRegistration> = Vec::new();

    for node in nodes {
        let instance_id = node.base_name();
        let service_port = match parse_service_port(instance_id) {
            Ok(port) => port,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        let value = node.value.as_deref().unwrap_or_default();
        let instance = match parse_service_instance(value) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(key = %node.key, "{}", e);
                continue;
            }
        };

        let slot = *index.entry(service_port).or_insert_with(|| {
            list.push(ServiceRegistration::new(service_port, Vec::new()));
            list.len() - 1
        });
        list[slot].instances.push(instance);
    }

    ServiceRegistrations(list)
}
