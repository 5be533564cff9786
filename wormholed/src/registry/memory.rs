//! In-process registry (for testing and dry runs)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use super::{Registry, RegistryError, RegistryNode, WatchHandle};

struct Inner {
    entries: RwLock<BTreeMap<String, String>>,
    /// Every changed key, in order. An empty key marks an availability toggle.
    changes: broadcast::Sender<String>,
    unavailable: AtomicBool,
}

/// Flat key/value map presented as a tree, with the same watch/read contract as etcd.
#[derive(Clone)]
pub struct InMemoryRegistry {
    inner: Arc<Inner>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                changes,
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Set a leaf value
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = normalize(&key.into());
        self.inner.entries.write().await.insert(key.clone(), value.into());
        self.notify(key);
    }

    /// Delete a leaf. Returns true if it existed.
    pub async fn delete(&self, key: &str) -> bool {
        let key = normalize(key);
        let existed = self.inner.entries.write().await.remove(&key).is_some();
        if existed {
            self.notify(key);
        }
        existed
    }

    /// Simulate a transport outage: every read and watch fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        // Wake pending watches so they observe the new state
        self.notify(String::new());
    }

    fn notify(&self, key: String) {
        // Fails only when no watch is open
        if self.inner.changes.send(key).is_err() {
            tracing::trace!("No open watches on in-memory registry");
        }
    }

    /// Get count of stored leaves
    pub async fn count(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        check_available(&self.inner)
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes a watch may fall behind by before it gives up tracking keys
const CHANGE_BUFFER: usize = 1024;

fn check_available(inner: &Inner) -> Result<(), RegistryError> {
    if inner.unavailable.load(Ordering::SeqCst) {
        Err(RegistryError::Unavailable("in-memory registry marked unavailable".to_string()))
    } else {
        Ok(())
    }
}

fn normalize(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

/// Build the children of `dir` from the sorted leaves below it.
fn children(dir: &str, entries: &BTreeMap<String, String>) -> Vec<RegistryNode> {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
    let mut nodes: Vec<RegistryNode> = Vec::new();

    for (key, value) in entries.range(prefix.clone()..) {
        let Some(rest) = key.strip_prefix(&prefix) else {
            break;
        };
        match rest.split_once('/') {
            None => nodes.push(RegistryNode::leaf(key.clone(), value.clone())),
            Some((segment, _)) => {
                let sub = format!("{}{}", prefix, segment);
                if nodes.last().map(|n| n.key != sub).unwrap_or(true) {
                    nodes.push(RegistryNode::dir(sub.clone(), children(&sub, entries)));
                }
            }
        }
    }
    nodes
}

#[async_trait]
impl Registry for InMemoryRegistry {
    type Watch = MemoryWatch;

    fn watch(&self, key: &str) -> MemoryWatch {
        MemoryWatch {
            inner: self.inner.clone(),
            rx: self.inner.changes.subscribe(),
            key: normalize(key),
        }
    }

    async fn read_tree(&self, key: &str) -> Result<Option<RegistryNode>, RegistryError> {
        self.check_available()?;

        let key = normalize(key);
        let entries = self.inner.entries.read().await;

        if let Some(value) = entries.get(&key) {
            return Ok(Some(RegistryNode::leaf(key, value.clone())));
        }

        let nodes = children(&key, &entries);
        if nodes.is_empty() && key != "/" {
            return Ok(None);
        }
        Ok(Some(RegistryNode::dir(key, nodes)))
    }
}

/// Recursive watch on an [`InMemoryRegistry`] subtree
pub struct MemoryWatch {
    inner: Arc<Inner>,
    rx: broadcast::Receiver<String>,
    key: String,
}

impl MemoryWatch {
    fn covers(&self, changed: &str) -> bool {
        self.key == "/"
            || changed == self.key
            || changed.strip_prefix(&self.key).is_some_and(|rest| rest.starts_with('/'))
    }
}

#[async_trait]
impl WatchHandle for MemoryWatch {
    async fn next(&mut self) -> Result<(), RegistryError> {
        loop {
            check_available(&self.inner)?;
            let changed = match self.rx.recv().await {
                Ok(changed) => changed,
                // Some keys were dropped, so any of them may have been ours
                Err(RecvError::Lagged(_)) => return check_available(&self.inner),
                Err(RecvError::Closed) => return Err(RegistryError::Closed),
            };
            check_available(&self.inner)?;

            if self.covers(&changed) {
                return Ok(());
            }
        }
    }
}
