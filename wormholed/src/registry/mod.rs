//! Abstract access to a hierarchical key/value registry.
//!
//! The daemon only needs two capabilities from a registry: a recursive watch on
//! a subtree and a recursive point-in-time read of it. Any store offering both
//! can be plugged in behind [`Registry`].

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// etcd error code for "Key not found"
const ETCD_KEY_NOT_FOUND: u64 = 100;

/// Registry transport errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("etcd error {code}: {message} ({cause})")]
    Etcd {
        code: u64,
        message: String,
        cause: String,
    },

    #[error("Failed to decode registry response: {0}")]
    Decode(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid registry endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Registry closed")]
    Closed,
}

impl RegistryError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, RegistryError::Etcd { code, .. } if *code == ETCD_KEY_NOT_FOUND)
    }
}

/// A node of the registry tree as returned by a recursive read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryNode {
    /// Absent on the root of the keyspace
    #[serde(default)]
    pub key: String,

    /// Absent for directory nodes
    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub dir: bool,

    #[serde(default)]
    pub nodes: Vec<RegistryNode>,

    #[serde(default)]
    pub modified_index: u64,
}

impl RegistryNode {
    pub fn leaf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn dir(key: impl Into<String>, nodes: Vec<RegistryNode>) -> Self {
        Self {
            key: key.into(),
            dir: true,
            nodes,
            ..Self::default()
        }
    }

    /// Final path segment of the key
    pub fn base_name(&self) -> &str {
        self.key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

/// A long-lived recursive watch on a registry subtree.
#[async_trait]
pub trait WatchHandle: Send {
    /// Block until something below the watched key changes.
    async fn next(&mut self) -> Result<(), RegistryError>;
}

/// The capability set the daemon needs from a registry.
#[async_trait]
pub trait Registry: Send + Sync {
    type Watch: WatchHandle;

    /// Open a new recursive watch on `key`. Opening is local; transport errors
    /// surface from [`WatchHandle::next`].
    fn watch(&self, key: &str) -> Self::Watch;

    /// Recursive, unsorted read of `key`. A missing key yields `Ok(None)`.
    async fn read_tree(&self, key: &str) -> Result<Option<RegistryNode>, RegistryError>;
}
