//! The contract between the binding engine and a coordination service.
//!
//! Three primitives are needed: a plain read, an atomic read that also arms
//! a single-fire watch, and a leader-election recipe that calls back into a
//! listener when leadership is granted and when the connection changes state.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoordinationError, CoordinationResult};
use crate::path::PathKey;

/// Connection state transitions reported to election listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First successful connection.
    Connected,
    /// Connection interrupted, the client is trying to get it back.
    Suspended,
    /// Connection re-established after a suspension.
    Reconnected,
    /// The session is gone; anything tied to it (leases, watches) is invalid.
    Lost,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Suspended => write!(f, "SUSPENDED"),
            ConnectionState::Reconnected => write!(f, "RECONNECTED"),
            ConnectionState::Lost => write!(f, "LOST"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    DataChanged,
    DataDeleted,
}

/// Notification delivered by a fired [`Watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathKey,
    pub kind: WatchEventKind,
}

/// A one-shot subscription to the next change of a path.
///
/// Resolves at most once. If the service drops the subscription without
/// firing it, the watch resolves to [`CoordinationError::WatchClosed`].
#[derive(Debug)]
pub struct Watch {
    path: PathKey,
    rx: oneshot::Receiver<WatchEvent>,
}

/// The service-side half of a [`Watch`].
#[derive(Debug)]
pub struct WatchTrigger {
    path: PathKey,
    tx: oneshot::Sender<WatchEvent>,
}

impl Watch {
    /// Create a connected trigger/watch pair for `path`.
    pub fn channel(path: PathKey) -> (WatchTrigger, Watch) {
        let (tx, rx) = oneshot::channel();
        (
            WatchTrigger {
                path: path.clone(),
                tx,
            },
            Watch { path, rx },
        )
    }

    pub fn path(&self) -> &PathKey {
        &self.path
    }
}

impl Future for Watch {
    type Output = CoordinationResult<WatchEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let path = self.path.clone();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| CoordinationError::WatchClosed(path.to_string()))
    }
}

impl WatchTrigger {
    /// Fire the watch. Returns false if nobody is waiting on it anymore.
    pub fn fire(self, kind: WatchEventKind) -> bool {
        self.tx
            .send(WatchEvent {
                path: self.path,
                kind,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes once the [`Watch`] half has been dropped.
    pub async fn closed(&mut self) {
        self.tx.closed().await
    }
}

/// Handed to [`ElectionListener::take_leadership`]; revoked when the
/// election primitive takes leadership away (session loss, failed lease
/// renewal, participation closed).
#[derive(Debug, Clone)]
pub struct LeadershipLease {
    path: PathKey,
    revoked: CancellationToken,
}

impl LeadershipLease {
    pub fn new(path: PathKey, revoked: CancellationToken) -> Self {
        Self { path, revoked }
    }

    pub fn path(&self) -> &PathKey {
        &self.path
    }

    /// Completes when leadership has been revoked.
    pub async fn revoked(&self) {
        self.revoked.cancelled().await
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }
}

/// Callbacks of one election participation.
#[async_trait]
pub trait ElectionListener: Send + Sync + 'static {
    /// Called when this candidate becomes leader. Leadership is held until
    /// this method returns; implementations must return once `lease` is
    /// revoked.
    async fn take_leadership(&self, lease: LeadershipLease);

    /// Called on every connection state transition.
    fn state_changed(&self, state: ConnectionState);
}

/// A running election participation. Dropping the handle cancels the
/// participation without waiting for it to wind down.
#[derive(Debug)]
pub struct ElectionHandle {
    path: PathKey,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ElectionHandle {
    pub fn new(path: PathKey, token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { path, token, tasks }
    }

    pub fn path(&self) -> &PathKey {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Withdraw candidacy, revoke any held leadership and wait for the
    /// participation's tasks to finish.
    pub async fn close(mut self) {
        self.token.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                debug!(path = %self.path, ?err, "election task ended abnormally");
            }
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A coordination service: hierarchical key/value data with single-fire
/// watches and a leader-election recipe. Implementations are shared between
/// many tasks and must be safe for concurrent use.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug + 'static {
    /// Current value of `path`, `None` if the path does not exist.
    async fn read_value(&self, path: &PathKey) -> CoordinationResult<Option<Bytes>>;

    /// Current value of `path` plus a watch armed for the next change after
    /// that value. No change is lost between the read and the arming.
    async fn read_value_and_watch(
        &self,
        path: &PathKey,
    ) -> CoordinationResult<(Option<Bytes>, Watch)>;

    async fn write_value(&self, path: &PathKey, value: Bytes) -> CoordinationResult<()>;

    async fn delete_value(&self, path: &PathKey) -> CoordinationResult<()>;

    /// Register a candidate for the election at `path` and start contending
    /// immediately.
    async fn run_election(
        &self,
        path: &PathKey,
        listener: Arc<dyn ElectionListener>,
    ) -> CoordinationResult<ElectionHandle>;

    fn connection_state(&self) -> ConnectionState;
}
