//! Lease registration
//!
//! A [`Worker`] keeps `namespace + name` alive in the store: it creates the
//! key with a TTL when it is missing and refreshes the TTL every heartbeat.

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::member::WorkerInfo;
use crate::store::{self, CoordinationStore, SetOptions};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest renewal period the heartbeat loop will run at
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unregistered,
    Registered,
    Stopped,
}

/// What a single heartbeat did to the worker key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Created,
    Refreshed,
}

pub struct Worker {
    info: WorkerInfo,
    key: String,
    store: Arc<dyn CoordinationStore>,
    config: DiscoveryConfig,
    /// Stop token of the current registration lifetime
    stop: Mutex<CancellationToken>,
    state: Mutex<WorkerState>,
    /// Held across a heartbeat so the unregister delete lands after it
    in_flight: tokio::sync::Mutex<()>,
}

impl Worker {
    /// Connect to the configured store
    pub async fn new<N: Into<String>, A: Into<String>>(
        name: N,
        address: A,
        config: DiscoveryConfig,
    ) -> Result<Self> {
        let store = store::connect(&config).await?;
        Ok(Self::with_store(name, address, config, store))
    }

    /// Build a worker over an existing store handle
    pub fn with_store<N: Into<String>, A: Into<String>>(
        name: N,
        address: A,
        config: DiscoveryConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let info = WorkerInfo::new(name, address);
        let key = config.worker_key(&info.name);

        if config.heartbeat_interval == 0 {
            tracing::warn!(
                "Worker '{}': heartbeat interval is 0s, renewing every {}s instead",
                info.name,
                MIN_HEARTBEAT.as_secs()
            );
        } else if config.heartbeat_interval >= config.lease_timeout {
            tracing::warn!(
                "Worker '{}': heartbeat interval {}s is not shorter than lease timeout {}s, the lease will lapse between renewals",
                info.name,
                config.heartbeat_interval,
                config.lease_timeout
            );
        }

        Self {
            info,
            key,
            store,
            config,
            stop: Mutex::new(CancellationToken::new()),
            state: Mutex::new(WorkerState::Unregistered),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }

    /// Store key this worker registers under
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// Keep the registration alive until [`Worker::unregister`] is called
    pub async fn register(&self) {
        self.register_with(CancellationToken::new()).await
    }

    /// Keep the registration alive until `token` is cancelled or
    /// [`Worker::unregister`] is called, whichever comes first.
    ///
    /// The first renewal is immediate, later ones are one heartbeat apart.
    /// The stop signals are checked between renewals and again once the
    /// in-flight slot is held, so no write follows an `unregister` delete.
    pub async fn register_with(&self, token: CancellationToken) {
        let stop = lock(&self.stop).clone();
        self.set_state(WorkerState::Registered);
        tracing::info!("Worker '{}' registering under '{}'", self.info.name, self.key);

        let period = self.heartbeat_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some(outcome) = self.heartbeat_unless_stopped(&stop, &token).await else {
                break;
            };
            match outcome {
                Ok(HeartbeatOutcome::Created) => {
                    tracing::info!("Worker '{}' registered at '{}'", self.info.name, self.key);
                }
                Ok(HeartbeatOutcome::Refreshed) => {
                    tracing::debug!("Worker '{}' lease refreshed", self.info.name);
                }
                Err(e) => {
                    tracing::warn!("Heartbeat for worker '{}' failed: {}", self.info.name, e);
                }
            }

            tokio::select! {
                biased;

                _ = stop.cancelled() => break,
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        self.set_state(WorkerState::Stopped);
        tracing::info!("Worker '{}' heartbeat stopped", self.info.name);
    }

    /// Create the worker key if it is missing, otherwise renew its TTL
    pub async fn heartbeat_once(&self) -> Result<HeartbeatOutcome> {
        let _in_flight = self.in_flight.lock().await;
        self.renew().await
    }

    /// Renew unless a stop arrived while waiting for the in-flight slot.
    ///
    /// An `unregister` queued ahead of this call has already deleted the
    /// key; writing now would bring it back.
    async fn heartbeat_unless_stopped(
        &self,
        stop: &CancellationToken,
        token: &CancellationToken,
    ) -> Option<Result<HeartbeatOutcome>> {
        let _in_flight = self.in_flight.lock().await;
        if stop.is_cancelled() || token.is_cancelled() {
            return None;
        }
        Some(self.renew().await)
    }

    fn heartbeat_period(&self) -> Duration {
        self.config.heartbeat_period().max(MIN_HEARTBEAT)
    }

    async fn renew(&self) -> Result<HeartbeatOutcome> {
        let ttl = self.config.lease_ttl();

        match self.store.get(&self.key, false).await {
            Ok(_) => {
                self.store.set(&self.key, "", SetOptions::refresh(ttl)).await?;
                Ok(HeartbeatOutcome::Refreshed)
            }
            Err(e) if e.is_key_not_found() => {
                let value = self.info.encode()?;
                self.store
                    .set(&self.key, &value, SetOptions::with_ttl(ttl))
                    .await?;
                Ok(HeartbeatOutcome::Created)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the heartbeat and delete the worker key.
    ///
    /// Never blocks on the heartbeat loop beyond a renewal already in
    /// flight; safe to call repeatedly. A later [`Worker::register`] starts a
    /// fresh lifetime.
    pub async fn unregister(&self) -> Result<()> {
        {
            let mut stop = lock(&self.stop);
            stop.cancel();
            *stop = CancellationToken::new();
        }
        self.set_state(WorkerState::Stopped);

        let _in_flight = self.in_flight.lock().await;
        match self.store.delete(&self.key, true).await {
            Ok(()) => {
                tracing::info!("Worker '{}' unregistered from '{}'", self.info.name, self.key);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to unregister worker '{}': {}", self.info.name, e);
                Err(e)
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        *lock(&self.state) = state;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
