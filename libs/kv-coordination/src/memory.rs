//! In-process coordination service.
//!
//! Behaves like the NATS backend from the binding engine's point of view:
//! single-fire watches, FIFO-fair leader election and connection state
//! transitions, which tests drive through [`MemoryCoordinator::set_connection_state`].
//! [`MemoryCoordinator::set`] and [`MemoryCoordinator::remove`] act as another
//! client of the service and ignore this client's connection state.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::{
    ConnectionState, Coordinator, ElectionHandle, ElectionListener, LeadershipLease, Watch,
    WatchEventKind, WatchTrigger,
};
use crate::election::{CurrentLease, forward_states};
use crate::error::{CoordinationError, CoordinationResult};
use crate::path::PathKey;

const STATE_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    data: Mutex<MemoryData>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionState>,
}

#[derive(Debug, Default)]
struct MemoryData {
    values: HashMap<PathKey, Bytes>,
    watches: HashMap<PathKey, Vec<WatchTrigger>>,
    elections: HashMap<PathKey, Arc<AsyncMutex<()>>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(MemoryData::default()),
                state,
                events,
            }),
        }
    }

    /// Write `value` as another client would, firing armed watches.
    pub fn set(&self, path: &PathKey, value: impl Into<Bytes>) {
        let triggers = {
            let mut data = self.inner.data.lock();
            data.values.insert(path.clone(), value.into());
            data.watches.remove(path).unwrap_or_default()
        };
        fire(triggers, WatchEventKind::DataChanged);
    }

    /// Delete `path` as another client would, firing armed watches.
    pub fn remove(&self, path: &PathKey) -> bool {
        let (existed, triggers) = {
            let mut data = self.inner.data.lock();
            let existed = data.values.remove(path).is_some();
            let triggers = if existed {
                data.watches.remove(path).unwrap_or_default()
            } else {
                Vec::new()
            };
            (existed, triggers)
        };
        fire(triggers, WatchEventKind::DataDeleted);
        existed
    }

    /// Current value as seen by the service, regardless of connection state.
    pub fn get(&self, path: &PathKey) -> Option<Bytes> {
        self.inner.data.lock().values.get(path).cloned()
    }

    /// Number of watches currently armed on `path`.
    pub fn armed_watches(&self, path: &PathKey) -> usize {
        self.inner
            .data
            .lock()
            .watches
            .get(path)
            .map(|triggers| triggers.iter().filter(|t| !t.is_closed()).count())
            .unwrap_or(0)
    }

    /// Simulate a connection state transition. While not connected, every
    /// [`Coordinator`] operation fails with a retryable error and held
    /// leadership is revoked.
    pub fn set_connection_state(&self, state: ConnectionState) {
        info!(%state, "memory coordinator connection state changed");
        self.inner.state.send_replace(state);
        // no receivers just means no election is running
        let _ = self.inner.events.send(state);
    }

    fn ensure_connected(&self) -> CoordinationResult<()> {
        let state = *self.inner.state.borrow();
        if state.is_connected() {
            Ok(())
        } else {
            Err(CoordinationError::NotConnected(format!(
                "memory coordinator is {state}"
            )))
        }
    }
}

fn fire(triggers: Vec<WatchTrigger>, kind: WatchEventKind) {
    for trigger in triggers {
        trigger.fire(kind);
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn read_value(&self, path: &PathKey) -> CoordinationResult<Option<Bytes>> {
        self.ensure_connected()?;
        Ok(self.get(path))
    }

    async fn read_value_and_watch(
        &self,
        path: &PathKey,
    ) -> CoordinationResult<(Option<Bytes>, Watch)> {
        self.ensure_connected()?;
        let (trigger, watch) = Watch::channel(path.clone());
        let mut data = self.inner.data.lock();
        let value = data.values.get(path).cloned();
        let triggers = data.watches.entry(path.clone()).or_default();
        triggers.retain(|t| !t.is_closed());
        triggers.push(trigger);
        Ok((value, watch))
    }

    async fn write_value(&self, path: &PathKey, value: Bytes) -> CoordinationResult<()> {
        self.ensure_connected()?;
        self.set(path, value);
        Ok(())
    }

    async fn delete_value(&self, path: &PathKey) -> CoordinationResult<()> {
        self.ensure_connected()?;
        self.remove(path);
        Ok(())
    }

    async fn run_election(
        &self,
        path: &PathKey,
        listener: Arc<dyn ElectionListener>,
    ) -> CoordinationResult<ElectionHandle> {
        let lock = self
            .inner
            .data
            .lock()
            .elections
            .entry(path.clone())
            .or_default()
            .clone();
        let token = CancellationToken::new();
        let current = CurrentLease::default();

        let forward = tokio::spawn(forward_states(
            path.clone(),
            self.inner.events.subscribe(),
            Arc::clone(&listener),
            Arc::clone(&current),
            token.clone(),
        ));
        let candidate = tokio::spawn(contend(
            path.clone(),
            lock,
            self.inner.state.subscribe(),
            listener,
            current,
            token.clone(),
        ));
        debug!(%path, "memory election participation started");
        Ok(ElectionHandle::new(
            path.clone(),
            token,
            vec![forward, candidate],
        ))
    }

    fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }
}

async fn contend(
    path: PathKey,
    lock: Arc<AsyncMutex<()>>,
    mut state: watch::Receiver<ConnectionState>,
    listener: Arc<dyn ElectionListener>,
    current: CurrentLease,
    token: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            res = state.wait_for(ConnectionState::is_connected) => res.is_ok(),
        };
        if !connected {
            return;
        }
        let guard = tokio::select! {
            _ = token.cancelled() => return,
            guard = Arc::clone(&lock).lock_owned() => guard,
        };
        if !state.borrow().is_connected() {
            // lost the connection while queued, go back to waiting
            drop(guard);
            continue;
        }

        let lease = token.child_token();
        *current.lock() = Some(lease.clone());
        debug!(%path, "memory election granted leadership");
        listener
            .take_leadership(LeadershipLease::new(path.clone(), lease.clone()))
            .await;
        lease.cancel();
        current.lock().take();
        drop(guard);
        debug!(%path, "memory election leadership released");
    }
}
