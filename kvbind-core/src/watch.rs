//! # watch
//!
//! Keeps DATA_CHANGE paths live. Each path gets one task that arms a
//! single-fire watch with the atomic read-and-watch primitive and, every time
//! the watch fires, re-arms it and applies the value read while re-arming to
//! the path's bindings. Events on one path are handled one at a time.
use std::{collections::BTreeMap, fmt, sync::Arc};

use kv_coordination::{
    CoordinationError, Coordinator, PathKey, RetryPolicy, Watch, WatchEvent, WatchEventKind,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span};
use tracing_futures::Instrument;

use crate::binding::Binding;
use crate::error::{BindError, BindResult};
use crate::metrics;
use crate::registry::decode;

/// synchronization state of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// task spawned, no watch yet
    Unarmed,
    /// waiting for the watch to fire
    Armed,
    /// re-reading and applying after a fire
    Refreshing,
    /// stopped, or the path was deleted
    Closed,
    /// ended with an error
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Unarmed => write!(f, "UNARMED"),
            SyncState::Armed => write!(f, "ARMED"),
            SyncState::Refreshing => write!(f, "REFRESHING"),
            SyncState::Closed => write!(f, "CLOSED"),
            SyncState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug)]
struct WatchedPath {
    state: watch::Receiver<SyncState>,
    token: CancellationToken,
    task: JoinHandle<BindResult<()>>,
}

/// Runs one synchronization task per watched path.
#[derive(Debug)]
pub struct WatchSynchronizer {
    coordinator: Arc<dyn Coordinator>,
    retry: RetryPolicy,
    paths: Mutex<BTreeMap<PathKey, WatchedPath>>,
    token: CancellationToken,
}

impl WatchSynchronizer {
    /// synchronizer without paths
    pub fn new(coordinator: Arc<dyn Coordinator>, retry: RetryPolicy) -> Self {
        Self {
            coordinator,
            retry,
            paths: Mutex::new(BTreeMap::new()),
            token: CancellationToken::new(),
        }
    }

    /// Start keeping `bindings` in sync with `path`. `initial` is the value
    /// already applied by the initial read, if any; when arming returns a
    /// different value it is applied. A path runs at most one
    /// synchronization; stop it before watching it again.
    pub fn watch(
        &self,
        path: PathKey,
        bindings: Arc<[Binding]>,
        initial: Option<String>,
    ) -> BindResult<()> {
        let mut paths = self.paths.lock();
        if paths.contains_key(&path) {
            return Err(BindError::AlreadyWatched { path });
        }
        let (state_tx, state_rx) = watch::channel(SyncState::Unarmed);
        let token = self.token.child_token();
        let span = info_span!("watch", %path);
        let sync = PathSync {
            path: path.clone(),
            bindings,
            last_applied: initial.clone(),
            initial,
            coordinator: Arc::clone(&self.coordinator),
            retry: self.retry,
            state: state_tx,
            token: token.clone(),
        };
        let task = tokio::spawn(sync.run().instrument(span));
        metrics::WATCHED_PATHS.inc();
        paths.insert(
            path,
            WatchedPath {
                state: state_rx,
                token,
                task,
            },
        );
        Ok(())
    }

    /// Wait until `path` has armed its first watch, so later writes are
    /// observed. Fails with the error the path ended with when it could not
    /// arm.
    pub async fn wait_armed(&self, path: &PathKey) -> BindResult<()> {
        let Some(mut rx) = self.subscribe_state(path) else {
            return Ok(());
        };
        // the sender is gone once the task ended, the last state tells why
        let _ = rx.wait_for(|state| *state != SyncState::Unarmed).await;
        let state = *rx.borrow();
        if state != SyncState::Failed {
            return Ok(());
        }
        match self.stop_path(path).await {
            Err(err) => Err(err),
            Ok(()) => Err(BindError::SyncFailed {
                paths: vec![path.clone()],
            }),
        }
    }

    /// current state of `path`
    pub fn state(&self, path: &PathKey) -> Option<SyncState> {
        self.paths.lock().get(path).map(|p| *p.state.borrow())
    }

    /// notified on every state change of `path`
    pub fn subscribe_state(&self, path: &PathKey) -> Option<watch::Receiver<SyncState>> {
        self.paths.lock().get(path).map(|p| p.state.clone())
    }

    /// state of every path
    pub fn states(&self) -> Vec<(PathKey, SyncState)> {
        self.paths
            .lock()
            .iter()
            .map(|(path, p)| (path.clone(), *p.state.borrow()))
            .collect()
    }

    /// Stop synchronizing one path without touching the others. Returns the
    /// error the path failed with, if it did.
    pub async fn stop_path(&self, path: &PathKey) -> BindResult<()> {
        let Some(watched) = self.paths.lock().remove(path) else {
            return Ok(());
        };
        watched.token.cancel();
        join(path, watched.task).await
    }

    /// Stop every path. Fails naming the paths whose synchronization ended
    /// with an error.
    pub async fn stop(&self) -> BindResult<()> {
        self.token.cancel();
        let paths = std::mem::take(&mut *self.paths.lock());
        let mut failed = Vec::new();
        for (path, watched) in paths {
            if join(&path, watched.task).await.is_err() {
                failed.push(path);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(BindError::SyncFailed { paths: failed })
        }
    }
}

async fn join(path: &PathKey, task: JoinHandle<BindResult<()>>) -> BindResult<()> {
    let res = match task.await {
        Ok(res) => res,
        Err(err) => {
            error!(%path, ?err, "synchronization task panicked");
            Err(BindError::SyncFailed {
                paths: vec![path.clone()],
            })
        }
    };
    metrics::WATCHED_PATHS.dec();
    res
}

struct PathSync {
    path: PathKey,
    bindings: Arc<[Binding]>,
    initial: Option<String>,
    last_applied: Option<String>,
    coordinator: Arc<dyn Coordinator>,
    retry: RetryPolicy,
    state: watch::Sender<SyncState>,
    token: CancellationToken,
}

impl PathSync {
    async fn run(mut self) -> BindResult<()> {
        let token = self.token.clone();
        let res = tokio::select! {
            _ = token.cancelled() => Ok(()),
            res = self.sync() => res,
        };
        match &res {
            Ok(()) => {
                self.state.send_replace(SyncState::Closed);
                debug!("path synchronization closed");
            }
            Err(err) => {
                self.state.send_replace(SyncState::Failed);
                error!(?err, "path synchronization failed");
            }
        }
        res
    }

    async fn sync(&mut self) -> BindResult<()> {
        let (value, mut watch) = self.arm().await?;
        if self.initial.is_some() && value.is_some() && value != self.initial {
            // changed between the initial read and arming
            self.apply_all(value)?;
        }
        info!("watch armed");

        loop {
            self.state.send_replace(SyncState::Armed);
            match watch.await {
                Ok(WatchEvent {
                    kind: WatchEventKind::DataChanged,
                    ..
                }) => {
                    metrics::WATCH_EVENTS.changed.inc();
                    self.state.send_replace(SyncState::Refreshing);
                    let (value, next) = self.arm().await?;
                    self.apply_all(value)?;
                    watch = next;
                }
                Ok(WatchEvent {
                    kind: WatchEventKind::DataDeleted,
                    ..
                }) => {
                    metrics::WATCH_EVENTS.deleted.inc();
                    info!("path deleted, ending synchronization");
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    // watch dropped by the service, usually a lost session
                    debug!(?err, "watch closed before firing, re-arming");
                    self.state.send_replace(SyncState::Refreshing);
                    let (value, next) = self.arm().await?;
                    if value != self.last_applied {
                        self.apply_all(value)?;
                    }
                    watch = next;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// read-and-watch with retries on transient failures
    async fn arm(&self) -> Result<(Option<String>, Watch), CoordinationError> {
        let mut attempts = 0u32;
        let (raw, watch) = self
            .retry
            .retry("read_value_and_watch", || {
                attempts += 1;
                if attempts > 1 {
                    metrics::WATCH_REARM_RETRIES.inc();
                }
                self.coordinator.read_value_and_watch(&self.path)
            })
            .await?;
        Ok((raw.map(|raw| decode(&self.path, &raw)), watch))
    }

    /// Apply to every binding in turn. A missing value applies nothing.
    fn apply_all(&mut self, value: Option<String>) -> BindResult<()> {
        let Some(value) = value else {
            debug!("path has no value, nothing to apply");
            return Ok(());
        };
        for binding in self.bindings.iter() {
            binding.apply(&value).map_err(|source| BindError::Apply {
                path: self.path.clone(),
                binding: binding.label().to_owned(),
                source,
            })?;
        }
        info!(value, bindings = self.bindings.len(), "applied value");
        self.last_applied = Some(value);
        Ok(())
    }
}
