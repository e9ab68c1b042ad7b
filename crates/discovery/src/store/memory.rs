//! In-process coordination store
//!
//! Mirrors the etcd v2 semantics the discovery code depends on: a single
//! monotonic index, per-key TTL timers that emit `expire`, refreshes that
//! renew a lease silently, and a bounded event history so watches can resume
//! from an index.

use super::{
    key_matches, CoordinationStore, PrevExist, SetOptions, Snapshot, StoreHealth, StoreNode,
    WatchAction, WatchEvent, WatchStream,
};
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

const HISTORY_CAPACITY: usize = 1000;
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Signal {
    Event(WatchEvent),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    created_index: u64,
    modified_index: u64,
}

#[derive(Debug)]
struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<WatchEvent>,
    /// Lowest index whose events are all still in `history`
    history_floor: u64,
    available: bool,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
}

/// In-memory [`CoordinationStore`]
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: BTreeMap::new(),
                    index: 0,
                    history: VecDeque::new(),
                    history_floor: 1,
                    available: true,
                }),
                events,
            }),
        }
    }

    /// Take the store offline (every call fails with `StoreUnavailable`) or
    /// bring it back. Lease timers keep running while offline.
    pub async fn set_available(&self, available: bool) {
        self.inner.state.lock().await.available = available;
    }

    /// Break every open watch stream with `reason`
    pub fn fail_watchers<T: Into<String>>(&self, reason: T) {
        let _ = self.inner.events.send(Signal::Fail(reason.into()));
    }

    /// Current store index
    pub async fn index(&self) -> u64 {
        self.inner.state.lock().await.index
    }

    fn schedule_expiry(&self, key: String, deadline: Instant) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                MemoryStore { inner }.expire(&key, deadline).await;
            }
        });
    }

    async fn expire(&self, key: &str, deadline: Instant) {
        let mut state = self.inner.state.lock().await;

        let due = matches!(state.entries.get(key), Some(entry) if entry.expires_at == Some(deadline));
        if !due {
            // Refreshed, rewritten or deleted since this timer was armed
            return;
        }

        let Some(old) = state.entries.remove(key) else {
            return;
        };
        state.index += 1;
        tracing::debug!("Lease on '{}' expired at index {}", key, state.index);

        let event = WatchEvent {
            action: WatchAction::Expire,
            node: StoreNode {
                key: key.to_string(),
                modified_index: state.index,
                created_index: old.created_index,
                ..Default::default()
            },
            prev_node: Some(leaf(key, &old, Instant::now())),
        };
        self.record(&mut state, event);
    }

    fn record(&self, state: &mut State, event: WatchEvent) {
        state.history.push_back(event.clone());
        while state.history.len() > HISTORY_CAPACITY {
            if let Some(evicted) = state.history.pop_front() {
                state.history_floor = evicted.index() + 1;
            }
        }

        // No receivers is fine
        let _ = self.inner.events.send(Signal::Event(event));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Snapshot> {
        let state = self.inner.state.lock().await;
        check_available(&state)?;

        let key = normalize(key);
        let now = Instant::now();

        if let Some(entry) = state.entries.get(&key) {
            return Ok(Snapshot {
                index: state.index,
                node: leaf(&key, entry, now),
            });
        }

        let descendants = descendants(&state.entries, &key);
        if descendants.is_empty() && key != "/" {
            return Err(DiscoveryError::key_not_found_at(key, state.index));
        }

        Ok(Snapshot {
            index: state.index,
            node: build_dir(&key, &descendants, recursive, now),
        })
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<StoreNode> {
        let mut state = self.inner.state.lock().await;
        check_available(&state)?;

        let key = normalize(key);
        if key == "/" {
            return Err(DiscoveryError::rejected(107, "Root is read only"));
        }

        let exists = state.entries.contains_key(&key);
        match options.prev_exist {
            PrevExist::Exist if !exists => {
                return Err(DiscoveryError::key_not_found_at(key, state.index))
            }
            PrevExist::NoExist if exists => {
                return Err(DiscoveryError::rejected(105, "Key already exists"))
            }
            _ => {}
        }

        let now = Instant::now();
        let deadline = options.ttl.map(|ttl| now + ttl);

        if options.refresh {
            if !value.is_empty() {
                return Err(DiscoveryError::rejected(111, "Value provided on refresh"));
            }
            let Some(deadline) = deadline else {
                return Err(DiscoveryError::rejected(212, "A TTL must be provided on refresh"));
            };
            if !exists {
                return Err(DiscoveryError::key_not_found_at(key, state.index));
            }

            state.index += 1;
            let index = state.index;
            let entry = state
                .entries
                .get_mut(&key)
                .ok_or_else(|| DiscoveryError::key_not_found(key.clone()))?;
            entry.expires_at = Some(deadline);
            entry.modified_index = index;
            let node = leaf(&key, entry, now);

            // Refreshes are invisible to watchers
            self.schedule_expiry(key, deadline);
            return Ok(node);
        }

        if !exists && !descendants(&state.entries, &key).is_empty() {
            return Err(DiscoveryError::rejected(102, "Not a file"));
        }
        if let Some(parent) = ancestors(&key).find(|parent| state.entries.contains_key(*parent)) {
            return Err(DiscoveryError::rejected(
                104,
                format!("Not a directory: {}", parent),
            ));
        }

        state.index += 1;
        let index = state.index;
        let previous = state.entries.get(&key).cloned();

        let action = match options.prev_exist {
            PrevExist::Ignore => WatchAction::Set,
            PrevExist::Exist => WatchAction::Update,
            PrevExist::NoExist => WatchAction::Create,
        };
        let created_index = match (&action, &previous) {
            (WatchAction::Update, Some(previous)) => previous.created_index,
            _ => index,
        };

        let entry = Entry {
            value: value.to_string(),
            expires_at: deadline,
            created_index,
            modified_index: index,
        };
        let node = leaf(&key, &entry, now);
        state.entries.insert(key.clone(), entry);

        let event = WatchEvent {
            action,
            node: node.clone(),
            prev_node: previous.map(|previous| leaf(&key, &previous, now)),
        };
        self.record(&mut state, event);

        if let Some(deadline) = deadline {
            self.schedule_expiry(key, deadline);
        }

        Ok(node)
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        check_available(&state)?;

        let key = normalize(key);
        let now = Instant::now();

        if let Some(old) = state.entries.remove(&key) {
            state.index += 1;
            let event = WatchEvent {
                action: WatchAction::Delete,
                node: StoreNode {
                    key: key.clone(),
                    modified_index: state.index,
                    created_index: old.created_index,
                    ..Default::default()
                },
                prev_node: Some(leaf(&key, &old, now)),
            };
            self.record(&mut state, event);
            return Ok(());
        }

        let doomed: Vec<String> = descendants(&state.entries, &key)
            .into_iter()
            .map(|(key, _)| key.to_string())
            .collect();
        if doomed.is_empty() {
            return Err(DiscoveryError::key_not_found_at(key, state.index));
        }
        if !recursive {
            return Err(DiscoveryError::rejected(102, "Not a file"));
        }

        for doomed_key in &doomed {
            state.entries.remove(doomed_key);
        }
        state.index += 1;

        // A directory delete is a single notification on the directory key
        let event = WatchEvent {
            action: WatchAction::Delete,
            node: StoreNode {
                key: key.clone(),
                dir: true,
                modified_index: state.index,
                ..Default::default()
            },
            prev_node: Some(StoreNode {
                key,
                dir: true,
                ..Default::default()
            }),
        };
        self.record(&mut state, event);

        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        recursive: bool,
        after_index: Option<u64>,
    ) -> Result<WatchStream> {
        let state = self.inner.state.lock().await;
        check_available(&state)?;

        let prefix = normalize(prefix);

        let mut replay = Vec::new();
        if let Some(after) = after_index {
            let start = after + 1;
            if start < state.history_floor {
                return Err(DiscoveryError::watch(format!(
                    "The event in requested index is outdated and cleared (requested: {}, oldest: {})",
                    start, state.history_floor
                )));
            }
            replay.extend(
                state
                    .history
                    .iter()
                    .filter(|event| event.index() >= start)
                    .filter(|event| key_matches(&prefix, &event.node.key, recursive))
                    .cloned(),
            );
        }

        // Subscribed under the state lock: nothing between replay and live
        let receiver = self.inner.events.subscribe();
        drop(state);

        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(Signal::Event(event)) if key_matches(&prefix, &event.node.key, recursive) => {
                    Some(Ok(event))
                }
                Ok(Signal::Event(_)) => None,
                Ok(Signal::Fail(reason)) => Some(Err(DiscoveryError::watch(reason))),
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(DiscoveryError::watch(
                    format!("Watcher fell behind by {} events", missed),
                ))),
            };
            future::ready(item)
        });

        Ok(Box::pin(stream::iter(replay.into_iter().map(Ok)).chain(live)))
    }

    async fn health_check(&self) -> Result<StoreHealth> {
        let start = std::time::Instant::now();
        let state = self.inner.state.lock().await;

        Ok(StoreHealth {
            healthy: state.available,
            latency_ms: start.elapsed().as_millis() as u64,
            endpoint: "memory".to_string(),
            error: (!state.available).then(|| "memory store is offline".to_string()),
        })
    }
}

fn check_available(state: &State) -> Result<()> {
    if state.available {
        Ok(())
    } else {
        Err(DiscoveryError::store_unavailable("memory store is offline"))
    }
}

/// Keys are stored without a trailing slash, like etcd reports them
fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn dir_prefix(key: &str) -> String {
    if key == "/" {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/')
        .map(move |(pos, _)| &key[..pos])
        .filter(|parent| !parent.is_empty())
}

fn descendants<'a>(entries: &'a BTreeMap<String, Entry>, key: &str) -> Vec<(&'a str, &'a Entry)> {
    let prefix = dir_prefix(key);
    entries
        .range(prefix.clone()..)
        .take_while(|(candidate, _)| candidate.starts_with(&prefix))
        .map(|(candidate, entry)| (candidate.as_str(), entry))
        .collect()
}

fn leaf(key: &str, entry: &Entry, now: Instant) -> StoreNode {
    StoreNode {
        key: key.to_string(),
        value: Some(entry.value.clone()),
        dir: false,
        nodes: Vec::new(),
        ttl: entry.expires_at.map(|deadline| {
            let remaining = deadline.saturating_duration_since(now);
            // Round up like etcd so a live lease never reports 0
            (remaining.as_millis() as i64 + 999) / 1000
        }),
        modified_index: entry.modified_index,
        created_index: entry.created_index,
    }
}

/// Build the directory node for `dir_key` from its sorted descendants
fn build_dir(dir_key: &str, entries: &[(&str, &Entry)], recursive: bool, now: Instant) -> StoreNode {
    let prefix = dir_prefix(dir_key);
    let mut nodes = Vec::new();
    let mut i = 0;

    while i < entries.len() {
        let (key, entry) = entries[i];
        let rest = &key[prefix.len()..];

        match rest.find('/') {
            None => {
                nodes.push(leaf(key, entry, now));
                i += 1;
            }
            Some(pos) => {
                let child_key = &key[..prefix.len() + pos];
                let child_prefix = dir_prefix(child_key);
                let end = entries[i..]
                    .iter()
                    .position(|(candidate, _)| !candidate.starts_with(&child_prefix))
                    .map_or(entries.len(), |offset| i + offset);

                let child = if recursive {
                    build_dir(child_key, &entries[i..end], true, now)
                } else {
                    StoreNode {
                        key: child_key.to_string(),
                        dir: true,
                        ..Default::default()
                    }
                };
                nodes.push(child);
                i = end;
            }
        }
    }

    StoreNode {
        key: dir_key.to_string(),
        dir: true,
        nodes,
        ..Default::default()
    }
}
