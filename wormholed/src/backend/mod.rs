//! Registry-facing half of the pipeline: watching a subtree for changes and
//! reading it into a [`ServiceRegistrations`] snapshot.

pub mod reader;
pub mod watcher;

use std::sync::Arc;
use shared::types::ServiceRegistrations;
use crate::registry::{Registry, RegistryError};
use self::reader::RegistrationReader;
use self::watcher::RegistryWatcher;

/// Watcher and reader bound to the same registry subtree
pub struct Backend<R: Registry> {
    watcher: RegistryWatcher<R>,
    reader: RegistrationReader<R>,
}

impl<R: Registry> Backend<R> {
    pub fn new(registry: Arc<R>, key: impl Into<String>, watch_error_threshold: u32) -> Self {
        let key = key.into();
        Self {
            watcher: RegistryWatcher::new(registry.clone(), key.clone(), watch_error_threshold),
            reader: RegistrationReader::new(registry, key),
        }
    }

    /// Wait for a change in the registry subtree
    pub async fn watch(&mut self) -> Result<(), RegistryError> {
        self.watcher.watch().await
    }

    /// Load all registered instances
    pub async fn get(&self) -> Result<ServiceRegistrations, RegistryError> {
        self.reader.read().await
    }

    pub fn consecutive_watch_errors(&self) -> u32 {
        self.watcher.consecutive_errors()
    }

    pub fn key(&self) -> &str {
        self.watcher.key()
    }
}
