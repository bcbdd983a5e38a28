//! # election
//!
//! One election participation per election path. Leadership flags follow
//! leadership: `true` while the lease is held, `false` otherwise. Any
//! ambiguity (a fresh connection, a lost session) resolves to `false`.
use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use kv_coordination::{
    ConnectionState, Coordinator, ElectionHandle, ElectionListener, LeadershipLease, PathKey,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::BoundValue;
use crate::error::{BindError, BindResult};
use crate::metrics;

/// state of one election participation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderState {
    /// not participating yet
    Follower,
    /// registered, waiting for leadership
    Candidate,
    /// holding leadership
    Leader,
    /// participation closed
    Stopped,
}

impl fmt::Display for LeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderState::Follower => write!(f, "FOLLOWER"),
            LeaderState::Candidate => write!(f, "CANDIDATE"),
            LeaderState::Leader => write!(f, "LEADER"),
            LeaderState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A leadership binding: a flag or a callback told whether we lead.
#[derive(Clone)]
pub enum LeaderTarget {
    /// flag slot
    Flag(BoundValue<bool>),
    /// callback receiving the new leadership status
    Invoker(Arc<dyn Fn(bool) + Send + Sync>),
}

impl LeaderTarget {
    /// bind a flag slot
    pub fn flag(slot: BoundValue<bool>) -> Self {
        LeaderTarget::Flag(slot)
    }

    /// bind a callback
    pub fn invoker<F>(f: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        LeaderTarget::Invoker(Arc::new(f))
    }

    fn set(&self, leader: bool) {
        match self {
            LeaderTarget::Flag(slot) => slot.set(leader),
            LeaderTarget::Invoker(f) => f(leader),
        }
    }
}

impl fmt::Debug for LeaderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderTarget::Flag(slot) => f.debug_tuple("Flag").field(slot).finish(),
            LeaderTarget::Invoker(_) => f.write_str("Invoker"),
        }
    }
}

#[derive(Debug)]
struct Participation {
    path: PathKey,
    targets: Arc<[LeaderTarget]>,
    state: watch::Sender<LeaderState>,
    step_down: Notify,
    stop: CancellationToken,
}

impl Participation {
    fn set_all(&self, leader: bool) {
        for target in self.targets.iter() {
            target.set(leader);
        }
    }
}

#[async_trait]
impl ElectionListener for Participation {
    async fn take_leadership(&self, lease: LeadershipLease) {
        if self.stop.is_cancelled() {
            return;
        }
        // registered before the state is published so no step-down is missed
        let step_down = self.step_down.notified();
        self.set_all(true);
        self.state.send_replace(LeaderState::Leader);
        metrics::LEADERSHIP_ACQUIRED.inc();
        metrics::LEADER_PATHS.inc();
        info!(path = %self.path, "took leadership");

        let reason = tokio::select! {
            _ = lease.revoked() => "revoked",
            _ = step_down => "stepped down",
            _ = self.stop.cancelled() => "stopped",
        };

        self.set_all(false);
        self.state.send_if_modified(|state| {
            if *state == LeaderState::Leader {
                *state = LeaderState::Candidate;
                true
            } else {
                false
            }
        });
        metrics::LEADERSHIP_RELEASED.inc();
        metrics::LEADER_PATHS.dec();
        info!(path = %self.path, reason, "released leadership");
    }

    fn state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected | ConnectionState::Lost => {
                debug!(path = %self.path, %state, "connection state changed, clearing leadership flags");
                self.set_all(false);
            }
            ConnectionState::Suspended | ConnectionState::Reconnected => {
                debug!(path = %self.path, %state, "connection state changed");
            }
        }
    }
}

#[derive(Debug)]
struct Running {
    participation: Arc<Participation>,
    handle: ElectionHandle,
}

/// Runs the election participations.
#[derive(Debug)]
pub struct LeaderElectionCoordinator {
    coordinator: Arc<dyn Coordinator>,
    running: Mutex<BTreeMap<PathKey, Running>>,
    stopped: Mutex<BTreeMap<PathKey, Arc<Participation>>>,
}

impl LeaderElectionCoordinator {
    /// coordinator without participations
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            running: Mutex::new(BTreeMap::new()),
            stopped: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register as a candidate for `path` and start contending. Flags start
    /// out `false`.
    pub async fn start(&self, path: PathKey, targets: Arc<[LeaderTarget]>) -> BindResult<()> {
        let (state, _) = watch::channel(LeaderState::Follower);
        let participation = Arc::new(Participation {
            path: path.clone(),
            targets,
            state,
            step_down: Notify::new(),
            stop: CancellationToken::new(),
        });
        participation.set_all(false);
        participation.state.send_replace(LeaderState::Candidate);

        let handle = self
            .coordinator
            .run_election(&path, Arc::clone(&participation) as Arc<dyn ElectionListener>)
            .await?;
        info!(%path, "election participation started");
        let previous = self.running.lock().insert(
            path,
            Running {
                participation,
                handle,
            },
        );
        if let Some(previous) = previous {
            warn!(path = %previous.participation.path, "replacing running election participation");
            previous.participation.stop.cancel();
        }
        Ok(())
    }

    /// Give up leadership of `path` if held. The participation stays a
    /// candidate. Returns whether leadership was held.
    pub fn step_down(&self, path: &PathKey) -> BindResult<bool> {
        let running = self.running.lock();
        let Some(running) = running.get(path) else {
            return Err(BindError::UnknownElection { path: path.clone() });
        };
        let leading = *running.participation.state.borrow() == LeaderState::Leader;
        if leading {
            info!(%path, "stepping down");
            running.participation.step_down.notify_waiters();
        }
        Ok(leading)
    }

    /// state of the participation on `path`
    pub fn state(&self, path: &PathKey) -> Option<LeaderState> {
        if let Some(running) = self.running.lock().get(path) {
            return Some(*running.participation.state.borrow());
        }
        self.stopped
            .lock()
            .get(path)
            .map(|p| *p.state.borrow())
    }

    /// notified on every state change of the participation on `path`
    pub fn subscribe_state(&self, path: &PathKey) -> Option<watch::Receiver<LeaderState>> {
        self.running
            .lock()
            .get(path)
            .map(|running| running.participation.state.subscribe())
    }

    /// `(path, state, number of targets)` of every participation
    pub fn states(&self) -> Vec<(PathKey, LeaderState, usize)> {
        let mut out: BTreeMap<PathKey, (LeaderState, usize)> = self
            .stopped
            .lock()
            .iter()
            .map(|(path, p)| (path.clone(), (*p.state.borrow(), p.targets.len())))
            .collect();
        for (path, running) in self.running.lock().iter() {
            let p = &running.participation;
            out.insert(path.clone(), (*p.state.borrow(), p.targets.len()));
        }
        out.into_iter()
            .map(|(path, (state, targets))| (path, state, targets))
            .collect()
    }

    /// Withdraw every candidacy, release parked leadership holders and wait
    /// for the participations to wind down.
    pub async fn stop(&self) {
        let running = std::mem::take(&mut *self.running.lock());
        for (path, Running { participation, handle }) in running {
            participation.stop.cancel();
            handle.close().await;
            participation.set_all(false);
            participation.state.send_replace(LeaderState::Stopped);
            info!(%path, "election participation stopped");
            self.stopped.lock().insert(path, participation);
        }
    }
}
