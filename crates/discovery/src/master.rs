//! Membership aggregation
//!
//! A [`Master`] loads the worker namespace once, then follows the store's
//! change stream and keeps a name-indexed view of every worker it has seen.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::member::{member_name, Member, WorkerInfo};
use crate::store::{self, CoordinationStore, StoreNode, WatchAction, WatchEvent};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// Change applied to the membership map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Added(Member),
    Updated(Member),
    Expired(Member),
    Removed(Member),
}

impl MembershipChange {
    pub fn member(&self) -> &Member {
        match self {
            MembershipChange::Added(member)
            | MembershipChange::Updated(member)
            | MembershipChange::Expired(member)
            | MembershipChange::Removed(member) => member,
        }
    }
}

/// Watches the worker namespace and maintains the membership map
pub struct Master {
    store: Arc<dyn CoordinationStore>,
    config: DiscoveryConfig,
    members: Arc<RwLock<HashMap<String, Member>>>,
    initialized: AtomicBool,
    /// Highest store index seen so far, meaningful once `index_known` is set
    last_index: AtomicU64,
    index_known: AtomicBool,
    shutdown: CancellationToken,
    event_sender: broadcast::Sender<MembershipChange>,
}

impl Master {
    /// Connect to the configured store
    pub async fn new(config: DiscoveryConfig) -> Result<Self> {
        let store = store::connect(&config).await?;
        Ok(Self::with_store(config, store))
    }

    /// Build an aggregator over an existing store handle
    pub fn with_store(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let (event_sender, _) = broadcast::channel(1000);

        Self {
            store,
            config,
            members: Arc::new(RwLock::new(HashMap::new())),
            initialized: AtomicBool::new(false),
            last_index: AtomicU64::new(0),
            index_known: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            event_sender,
        }
    }

    /// Load the namespace on first call, then apply changes until the
    /// watch fails, the stream ends, or [`Master::shutdown`] is called.
    ///
    /// Calling `run` again after a watch failure resumes after the last
    /// applied index without reloading the namespace.
    pub async fn run(&self) -> Result<()> {
        let namespace = self.config.worker_namespace.as_str();

        if !self.initialized.load(Ordering::Acquire) {
            self.load_snapshot(namespace).await;
            self.initialized.store(true, Ordering::Release);
        }

        let after_index = self.last_index();
        let mut events = self.store.watch(namespace, true, after_index).await?;
        tracing::info!(
            "Watching '{}' for membership changes (after index {:?})",
            namespace,
            after_index
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    tracing::info!("Membership watch on '{}' stopped", namespace);
                    return Ok(());
                }
                item = events.next() => match item {
                    Some(Ok(event)) => self.apply_event(&event).await,
                    Some(Err(e)) => {
                        tracing::error!("Membership watch on '{}' failed: {}", namespace, e);
                        return Err(e);
                    }
                    None => {
                        tracing::warn!("Membership watch on '{}' ended", namespace);
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn load_snapshot(&self, namespace: &str) {
        let snapshot = match self.store.get(namespace, true).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_key_not_found() => {
                tracing::info!("Namespace '{}' does not exist yet, starting empty", namespace);
                // Resume from the miss so writes landing before the watch opens are replayed
                if let Some(index) = e.store_index() {
                    self.record_index(index);
                }
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to read namespace '{}', starting empty: {}", namespace, e);
                return;
            }
        };

        let mut leaves = Vec::new();
        collect_leaves(&snapshot.node, &mut leaves);

        let mut members = self.members.write().await;
        for node in leaves {
            let Some(info) = WorkerInfo::decode_lenient(&node.key, node.value_str()) else {
                continue;
            };
            members
                .entry(info.name.clone())
                .and_modify(|member| member.refresh(&info))
                .or_insert_with(|| Member::from_info(&info));
        }
        let loaded = members.len();
        drop(members);

        self.record_index(snapshot.index);
        tracing::info!(
            "Loaded {} members from '{}' at index {}",
            loaded,
            namespace,
            snapshot.index
        );
    }

    /// Apply one change notification to the membership map
    pub(crate) async fn apply_event(&self, event: &WatchEvent) {
        let key = event.node.key.as_str();

        let change = match event.action {
            WatchAction::Set | WatchAction::Update => {
                match WorkerInfo::decode_lenient(key, event.node.value_str()) {
                    Some(info) => {
                        let mut members = self.members.write().await;
                        match members.get_mut(&info.name) {
                            Some(member) => {
                                member.refresh(&info);
                                Some(MembershipChange::Updated(member.clone()))
                            }
                            None => {
                                let member = Member::from_info(&info);
                                members.insert(info.name.clone(), member.clone());
                                Some(MembershipChange::Added(member))
                            }
                        }
                    }
                    None => None,
                }
            }
            WatchAction::Expire => {
                let mut members = self.members.write().await;
                members.get_mut(member_name(key)).map(|member| {
                    member.in_group = false;
                    MembershipChange::Expired(member.clone())
                })
            }
            WatchAction::Delete => {
                let mut members = self.members.write().await;
                members
                    .remove(member_name(key))
                    .map(MembershipChange::Removed)
            }
            _ => {
                tracing::debug!("Ignoring '{}' notification for '{}'", event.action, key);
                None
            }
        };

        self.record_index(event.index());

        if let Some(change) = change {
            match &change {
                MembershipChange::Added(member) => tracing::info!("Member joined: {}", member),
                MembershipChange::Updated(member) => tracing::info!("Member updated: {}", member),
                MembershipChange::Expired(member) => tracing::info!("Member expired: {}", member),
                MembershipChange::Removed(member) => tracing::info!("Member left: {}", member),
            }
            // No receivers is fine
            let _ = self.event_sender.send(change);
        }
    }

    /// Copy of the member registered under `name`
    pub async fn find_by_name(&self, name: &str) -> Option<Member> {
        self.members.read().await.get(name).cloned()
    }

    /// Copy of the whole membership map
    pub async fn list_members(&self) -> HashMap<String, Member> {
        self.members.read().await.clone()
    }

    /// Members whose lease is live, sorted by name
    pub async fn alive_members(&self) -> Vec<Member> {
        let mut alive: Vec<Member> = self
            .members
            .read()
            .await
            .values()
            .filter(|member| member.in_group)
            .cloned()
            .collect();
        alive.sort_by(|a, b| a.name.cmp(&b.name));
        alive
    }

    /// Subscribe to applied membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.event_sender.subscribe()
    }

    /// True once the initial namespace read has been attempted
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Highest store index seen, if any
    pub fn last_index(&self) -> Option<u64> {
        if self.index_known.load(Ordering::Acquire) {
            Some(self.last_index.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn record_index(&self, index: u64) {
        self.last_index.fetch_max(index, Ordering::AcqRel);
        self.index_known.store(true, Ordering::Release);
    }

    /// Stop a running [`Master::run`]; later calls return immediately
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Connectivity of the underlying store
    pub async fn store_healthy(&self) -> Result<()> {
        let health = self.store.health_check().await?;
        if health.healthy {
            Ok(())
        } else {
            Err(DiscoveryError::store_unavailable(
                health.error.unwrap_or(health.endpoint),
            ))
        }
    }
}

fn collect_leaves<'a>(node: &'a StoreNode, leaves: &mut Vec<&'a StoreNode>) {
    if node.dir {
        for child in &node.nodes {
            collect_leaves(child, leaves);
        }
    } else {
        leaves.push(node);
    }
}
