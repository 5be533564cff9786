use std::sync::Arc;
use tracing::{debug, info};
use crate::registry::{Registry, RegistryError, WatchHandle};

/// Long-polls one registry subtree and reports that it has plausibly changed.
///
/// A watch handle that keeps failing may be stuck on a cursor the server no
/// longer accepts, so once more than `error_threshold` consecutive calls have
/// failed the handle is dropped and a fresh one opened. The watcher never
/// sleeps; pacing is up to the caller.
pub struct RegistryWatcher<R: Registry> {
    registry: Arc<R>,
    key: String,
    handle: Option<R::Watch>,
    recent_errors: u32,
    error_threshold: u32,
}

impl<R: Registry> RegistryWatcher<R> {
    /// Opens the watch handle right away so changes made after construction are not missed.
    pub fn new(registry: Arc<R>, key: impl Into<String>, error_threshold: u32) -> Self {
        let key = key.into();
        let handle = registry.watch(&key);
        Self {
            registry,
            key,
            handle: Some(handle),
            recent_errors: 0,
            error_threshold,
        }
    }

    /// Block until the subtree changes or the transport fails.
    pub async fn watch(&mut self) -> Result<(), RegistryError> {
        if self.handle.is_none() || self.recent_errors > self.error_threshold {
            if self.recent_errors > 0 {
                info!(
                    key = %self.key,
                    errors = self.recent_errors,
                    "Re-establishing registry watch after repeated failures"
                );
            }
            self.recent_errors = 0;
            self.handle = Some(self.registry.watch(&self.key));
        }

        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return Err(RegistryError::Closed),
        };

        match handle.next().await {
            Ok(()) => {
                self.recent_errors = 0;
                debug!(key = %self.key, "Registry change signaled");
                Ok(())
            }
            Err(e) => {
                self.recent_errors += 1;
                Err(e)
            }
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.recent_errors
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
