//! Coordination store interface
//!
//! The aggregator and the registrants only talk to the store through
//! [`CoordinationStore`]. Two implementations ship with the crate:
//! [`EtcdStore`] speaks the etcd v2 keys API over HTTP, [`MemoryStore`]
//! keeps everything in process and is what the tests run against.

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::config::DiscoveryConfig;
use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A key or directory in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreNode {
    pub key: String,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub dir: bool,

    #[serde(default)]
    pub nodes: Vec<StoreNode>,

    /// Remaining lease in seconds, if the key has one
    #[serde(default)]
    pub ttl: Option<i64>,

    #[serde(default)]
    pub modified_index: u64,

    #[serde(default)]
    pub created_index: u64,
}

impl StoreNode {
    /// Value of a leaf node, empty for directories
    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

/// Result of a read: the node tree and the store index it was taken at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    pub node: StoreNode,
}

/// Kind of change a watch notification reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Get,
    Set,
    Update,
    Create,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    Unknown(String),
}

impl From<&str> for WatchAction {
    fn from(action: &str) -> Self {
        match action {
            "get" => WatchAction::Get,
            "set" => WatchAction::Set,
            "update" => WatchAction::Update,
            "create" => WatchAction::Create,
            "delete" => WatchAction::Delete,
            "expire" => WatchAction::Expire,
            "compareAndSwap" => WatchAction::CompareAndSwap,
            "compareAndDelete" => WatchAction::CompareAndDelete,
            other => WatchAction::Unknown(other.to_string()),
        }
    }
}

impl WatchAction {
    pub fn as_str(&self) -> &str {
        match self {
            WatchAction::Get => "get",
            WatchAction::Set => "set",
            WatchAction::Update => "update",
            WatchAction::Create => "create",
            WatchAction::Delete => "delete",
            WatchAction::Expire => "expire",
            WatchAction::CompareAndSwap => "compareAndSwap",
            WatchAction::CompareAndDelete => "compareAndDelete",
            WatchAction::Unknown(action) => action,
        }
    }
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub node: StoreNode,
    pub prev_node: Option<StoreNode>,
}

impl WatchEvent {
    /// Store index assigned to this change
    pub fn index(&self) -> u64 {
        self.node.modified_index
    }
}

/// Precondition on the key's existence for a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevExist {
    #[default]
    Ignore,
    Exist,
    NoExist,
}

/// Options for [`CoordinationStore::set`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,

    /// Renew the TTL without touching the value or notifying watchers
    pub refresh: bool,

    pub prev_exist: PrevExist,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    /// TTL renewal of an existing key
    pub fn refresh(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            refresh: true,
            prev_exist: PrevExist::Exist,
        }
    }
}

/// Coordination store health information
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub endpoint: String,
    pub error: Option<String>,
}

/// Ordered, unbounded sequence of change notifications.
///
/// An `Err` item means the subscription is broken; consumers stop there.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// Strongly consistent key-value store with TTLs and prefix watches
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key or directory; `KeyNotFound` when absent
    async fn get(&self, key: &str, recursive: bool) -> Result<Snapshot>;

    /// Write a key
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<StoreNode>;

    /// Remove a key, or a directory tree when `recursive`
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;

    /// Subscribe to changes under `prefix`.
    ///
    /// With `after_index` the stream starts at the first change whose index
    /// is greater; without it, at the next change to happen.
    async fn watch(
        &self,
        prefix: &str,
        recursive: bool,
        after_index: Option<u64>,
    ) -> Result<WatchStream>;

    /// Connectivity probe
    async fn health_check(&self) -> Result<StoreHealth>;
}

/// Connect to the store described by `config`
pub async fn connect(config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationStore>> {
    let store = EtcdStore::connect(config).await?;
    Ok(Arc::new(store))
}

/// True when `key` is `prefix` itself or lies beneath it
pub(crate) fn key_matches(prefix: &str, key: &str, recursive: bool) -> bool {
    if key == prefix {
        return true;
    }
    if !recursive {
        return false;
    }
    if prefix.ends_with('/') {
        key.starts_with(prefix)
    } else {
        key.strip_prefix(prefix)
            .map_or(false, |rest| rest.starts_with('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_action_parsing() {
        for action in ["get", "set", "update", "create", "delete", "expire"] {
            assert_eq!(WatchAction::from(action).as_str(), action);
        }
        assert_eq!(
            WatchAction::from("compareAndSwap"),
            WatchAction::CompareAndSwap
        );
        assert_eq!(
            WatchAction::from("frobnicate"),
            WatchAction::Unknown("frobnicate".to_string())
        );
    }

    #[test]
    fn test_key_matching() {
        assert!(key_matches("/workers/", "/workers/a", true));
        assert!(key_matches("/workers", "/workers/a", true));
        assert!(!key_matches("/workers", "/workersx/a", true));
        assert!(!key_matches("/workers/", "/workers/a", false));
        assert!(key_matches("/workers/a", "/workers/a", false));
    }

    #[test]
    fn test_refresh_options() {
        let options = SetOptions::refresh(Duration::from_secs(10));
        assert!(options.refresh);
        assert_eq!(options.prev_exist, PrevExist::Exist);
        assert_eq!(options.ttl, Some(Duration::from_secs(10)));

        let options = SetOptions::with_ttl(Duration::from_secs(10));
        assert!(!options.refresh);
        assert_eq!(options.prev_exist, PrevExist::Ignore);
    }

    #[test]
    fn test_node_deserialization() {
        let node: StoreNode = serde_json::from_str(
            r#"{"key":"/workers","dir":true,"nodes":[
                {"key":"/workers/a","value":"{}","ttl":42,"modifiedIndex":7,"createdIndex":5}
            ],"modifiedIndex":3,"createdIndex":3}"#,
        )
        .unwrap();

        assert!(node.dir);
        assert_eq!(node.nodes.len(), 1);
        assert_eq!(node.nodes[0].ttl, Some(42));
        assert_eq!(node.nodes[0].modified_index, 7);
        assert_eq!(node.nodes[0].value_str(), "{}");
        assert_eq!(node.value_str(), "");
    }
}
