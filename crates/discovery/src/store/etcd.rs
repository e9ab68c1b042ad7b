//! etcd v2 keys API client

use super::{
    CoordinationStore, PrevExist, SetOptions, Snapshot, StoreHealth, StoreNode, WatchAction,
    WatchEvent, WatchStream,
};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use futures::stream;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const INDEX_HEADER: &str = "X-Etcd-Index";
const ERROR_KEY_NOT_FOUND: u64 = 100;
const ERROR_EVENT_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysResponse {
    action: String,

    #[serde(default)]
    node: Option<StoreNode>,

    #[serde(default)]
    prev_node: Option<StoreNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u64,
    message: String,

    #[serde(default)]
    cause: Option<String>,

    #[serde(default)]
    index: Option<u64>,
}

/// HTTP client for an etcd cluster speaking the v2 keys API.
///
/// Requests go to the active endpoint; on a connection failure the next
/// configured endpoint is tried and becomes active if it answers.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    endpoints: Arc<Vec<String>>,
    active: Arc<AtomicUsize>,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Build a client without touching the network
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        if config.store_nodes.is_empty() {
            return Err(DiscoveryError::configuration(
                "No coordination store endpoints configured",
            ));
        }

        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| DiscoveryError::store(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: Arc::new(
                config
                    .store_nodes
                    .iter()
                    .map(|node| node.trim_end_matches('/').to_string())
                    .collect(),
            ),
            active: Arc::new(AtomicUsize::new(0)),
            request_timeout: config.request_timeout(),
        })
    }

    /// Build a client and verify that at least one endpoint answers
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let store = Self::new(config)?;
        let health = store.health_check().await?;

        if !health.healthy {
            return Err(DiscoveryError::store_unavailable(format!(
                "cannot connect to {:?}: {}",
                store.endpoints,
                health.error.unwrap_or_default()
            )));
        }

        tracing::info!(
            "Connected to coordination store at {} ({}ms)",
            health.endpoint,
            health.latency_ms
        );
        Ok(store)
    }

    /// Endpoint requests are currently sent to
    pub fn active_endpoint(&self) -> &str {
        &self.endpoints[self.active.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        let count = self.endpoints.len();
        let start = self.active.load(Ordering::Relaxed) % count;
        let mut last_error = String::new();

        for offset in 0..count {
            let i = (start + offset) % count;
            let endpoint = &self.endpoints[i];

            match build(&self.client, endpoint).send().await {
                Ok(response) => {
                    if i != start {
                        tracing::info!("Switched coordination store endpoint to {}", endpoint);
                        self.active.store(i, Ordering::Relaxed);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_connect() => {
                    tracing::warn!("Store endpoint {} unreachable: {}", endpoint, e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DiscoveryError::store_unavailable(format!(
            "no store endpoint reachable: {}",
            last_error
        )))
    }

    async fn next_event(
        &self,
        prefix: &str,
        recursive: bool,
        wait_index: Option<u64>,
    ) -> Result<WatchEvent> {
        loop {
            let response = self
                .send(|client, endpoint| {
                    let request = client
                        .get(keys_url(endpoint, prefix))
                        .query(&[("wait", true), ("recursive", recursive)]);
                    match wait_index {
                        Some(index) => request.query(&[("waitIndex", index)]),
                        None => request,
                    }
                })
                .await?;

            let status = response.status();
            let body = response.text().await?;

            if status.is_success() && body.trim().is_empty() {
                tracing::trace!("Watch on '{}' closed without an event, polling again", prefix);
                continue;
            }
            if !status.is_success() {
                return Err(match error_from_body(status, &body, prefix) {
                    DiscoveryError::StoreRejected { code, message }
                        if code == ERROR_EVENT_INDEX_CLEARED =>
                    {
                        DiscoveryError::watch(message)
                    }
                    other => other,
                });
            }

            let parsed: KeysResponse = serde_json::from_str(&body)
                .map_err(|e| DiscoveryError::watch(format!("Malformed watch response: {}", e)))?;
            let node = parsed
                .node
                .ok_or_else(|| DiscoveryError::watch("Watch response carried no node"))?;

            return Ok(WatchEvent {
                action: WatchAction::from(parsed.action.as_str()),
                node,
                prev_node: parsed.prev_node,
            });
        }
    }
}

struct WatchCursor {
    store: EtcdStore,
    prefix: String,
    recursive: bool,
    wait_index: Option<u64>,
    done: bool,
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Snapshot> {
        let response = self
            .send(|client, endpoint| {
                client
                    .get(keys_url(endpoint, key))
                    .query(&[("recursive", recursive)])
                    .timeout(self.request_timeout)
            })
            .await?;

        let (index, parsed) = read_response(response, key).await?;
        let node = parsed
            .node
            .ok_or_else(|| DiscoveryError::store("Read response carried no node"))?;

        Ok(Snapshot {
            index: if index > 0 { index } else { node.modified_index },
            node,
        })
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<StoreNode> {
        let mut form: Vec<(&str, String)> = Vec::new();
        if !options.refresh || !value.is_empty() {
            form.push(("value", value.to_string()));
        }
        if let Some(ttl) = options.ttl {
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }
        if options.refresh {
            form.push(("refresh", "true".to_string()));
        }
        match options.prev_exist {
            PrevExist::Exist => form.push(("prevExist", "true".to_string())),
            PrevExist::NoExist => form.push(("prevExist", "false".to_string())),
            PrevExist::Ignore => {}
        }

        let response = self
            .send(|client, endpoint| {
                client
                    .put(keys_url(endpoint, key))
                    .form(&form)
                    .timeout(self.request_timeout)
            })
            .await?;

        let (_, parsed) = read_response(response, key).await?;
        parsed
            .node
            .ok_or_else(|| DiscoveryError::store("Write response carried no node"))
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let response = self
            .send(|client, endpoint| {
                client
                    .delete(keys_url(endpoint, key))
                    .query(&[("recursive", recursive)])
                    .timeout(self.request_timeout)
            })
            .await?;

        read_response(response, key).await?;
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        recursive: bool,
        after_index: Option<u64>,
    ) -> Result<WatchStream> {
        let cursor = WatchCursor {
            store: self.clone(),
            prefix: prefix.to_string(),
            recursive,
            wait_index: after_index.map(|index| index + 1),
            done: false,
        };

        // Long polls carry no request timeout; the header timeout would cut them off
        let events = stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }

            let item = cursor
                .store
                .next_event(&cursor.prefix, cursor.recursive, cursor.wait_index)
                .await;
            match &item {
                Ok(event) => cursor.wait_index = Some(event.index() + 1),
                Err(_) => cursor.done = true,
            }
            Some((item, cursor))
        });

        Ok(Box::pin(events))
    }

    async fn health_check(&self) -> Result<StoreHealth> {
        let count = self.endpoints.len();
        let start = self.active.load(Ordering::Relaxed) % count;
        let mut last_error = None;

        for offset in 0..count {
            let i = (start + offset) % count;
            let endpoint = &self.endpoints[i];
            let started = Instant::now();

            let result = self
                .client
                .get(format!("{}/version", endpoint))
                .timeout(self.request_timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    self.active.store(i, Ordering::Relaxed);
                    return Ok(StoreHealth {
                        healthy: true,
                        latency_ms: started.elapsed().as_millis() as u64,
                        endpoint: endpoint.clone(),
                        error: None,
                    });
                }
                Ok(response) => {
                    last_error = Some(format!("{} answered {}", endpoint, response.status()));
                }
                Err(e) => {
                    tracing::debug!("Health probe to {} failed: {}", endpoint, e);
                    last_error = Some(format!("{}: {}", endpoint, e));
                }
            }
        }

        Ok(StoreHealth {
            healthy: false,
            latency_ms: 0,
            endpoint: self.active_endpoint().to_string(),
            error: last_error,
        })
    }
}

fn keys_url(endpoint: &str, key: &str) -> String {
    if key.starts_with('/') {
        format!("{}/v2/keys{}", endpoint, key)
    } else {
        format!("{}/v2/keys/{}", endpoint, key)
    }
}

async fn read_response(response: Response, key: &str) -> Result<(u64, KeysResponse)> {
    let status = response.status();
    let index = response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    let body = response.text().await?;

    if !status.is_success() {
        return Err(error_from_body(status, &body, key));
    }

    Ok((index, serde_json::from_str(&body)?))
}

fn error_from_body(status: StatusCode, body: &str, key: &str) -> DiscoveryError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(error) if error.error_code == ERROR_KEY_NOT_FOUND => {
            let key = error.cause.unwrap_or_else(|| key.to_string());
            match error.index {
                Some(index) => DiscoveryError::key_not_found_at(key, index),
                None => DiscoveryError::key_not_found(key),
            }
        }
        Ok(error) => {
            let message = match error.cause {
                Some(cause) => format!("{} ({})", error.message, cause),
                None => error.message,
            };
            DiscoveryError::rejected(error.error_code, message)
        }
        Err(_) => DiscoveryError::store(format!(
            "Unexpected response {} for '{}': {}",
            status,
            key,
            body.trim()
        )),
    }
}
