//! Lease-based leader election over a JetStream KV bucket.
//!
//! The leader is whoever managed to `create` the election key. It keeps the
//! key alive by updating it (compare-and-set on the revision) every renew
//! interval; the bucket's `max_age` expires a key whose owner stopped
//! renewing. Everyone else polls with `create` every retry delay.

use std::{sync::Arc, time::Duration};

use async_nats::jetstream::kv::{self, CreateErrorKind};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::NatsClient;
use crate::coordinator::{ConnectionState, ElectionListener, LeadershipLease};
use crate::path::PathKey;

/// Lease token of the leadership currently held by a participation, if any.
pub(crate) type CurrentLease = Arc<Mutex<Option<CancellationToken>>>;

/// Pass connection state transitions on to `listener`, revoking held
/// leadership as soon as the connection is no longer usable.
pub(crate) async fn forward_states(
    path: PathKey,
    mut events: broadcast::Receiver<ConnectionState>,
    listener: Arc<dyn ElectionListener>,
    current: CurrentLease,
    token: CancellationToken,
) {
    loop {
        let state = tokio::select! {
            _ = token.cancelled() => return,
            state = events.recv() => state,
        };
        match state {
            Ok(state) => {
                if !state.is_connected()
                    && let Some(lease) = current.lock().take()
                {
                    debug!(%path, %state, "revoking leadership");
                    lease.cancel();
                }
                listener.state_changed(state);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(%path, skipped, "connection state events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Election timing, see `config::ElectionConfig`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElectionTiming {
    pub renew_interval: Duration,
    pub retry_delay: Duration,
}

impl From<&config::ElectionConfig> for ElectionTiming {
    fn from(cfg: &config::ElectionConfig) -> Self {
        Self {
            renew_interval: cfg.renew_interval,
            retry_delay: cfg.retry_delay,
        }
    }
}

/// One candidate contending for `path` until `token` is cancelled.
pub(crate) struct Candidate {
    pub client: NatsClient,
    pub store: kv::Store,
    pub path: PathKey,
    pub id: Bytes,
    pub timing: ElectionTiming,
    pub listener: Arc<dyn ElectionListener>,
    pub current: CurrentLease,
    pub token: CancellationToken,
}

impl Candidate {
    pub(crate) async fn run(self) {
        let mut state = self.client.subscribe_state();
        loop {
            let connected = tokio::select! {
                _ = self.token.cancelled() => return,
                res = state.wait_for(ConnectionState::is_connected) => res.is_ok(),
            };
            if !connected {
                return;
            }

            if let Some(revision) = self.try_acquire().await {
                self.lead(revision, &state).await;
            }

            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(self.timing.retry_delay) => {}
            }
        }
    }

    async fn try_acquire(&self) -> Option<u64> {
        let key = self.path.kv_key();
        let created = self
            .client
            .timed(
                &format!("election create of '{}'", self.path),
                async {
                    match self.store.create(key, self.id.clone()).await {
                        Ok(revision) => Ok(Some(revision)),
                        Err(err) if err.kind() == CreateErrorKind::AlreadyExists => Ok(None),
                        Err(err) => Err(err),
                    }
                },
            )
            .await;
        match created {
            Ok(revision) => revision,
            Err(err) => {
                warn!(path = %self.path, error = %err, "election attempt failed");
                None
            }
        }
    }

    async fn lead(&self, revision: u64, state: &watch::Receiver<ConnectionState>) {
        let lease = self.token.child_token();
        *self.current.lock() = Some(lease.clone());
        if !state.borrow().is_connected() {
            // suspended between acquiring and publishing the lease
            lease.cancel();
        }
        info!(path = %self.path, revision, "acquired leadership");

        let renew = tokio::spawn(renew(
            self.client.clone(),
            self.store.clone(),
            self.path.clone(),
            self.id.clone(),
            revision,
            self.timing.renew_interval,
            lease.clone(),
            Arc::clone(&self.listener),
        ));
        self.listener
            .take_leadership(LeadershipLease::new(self.path.clone(), lease.clone()))
            .await;
        lease.cancel();
        self.current.lock().take();

        match renew.await {
            Ok(true) => self.release().await,
            Ok(false) => {}
            Err(err) => debug!(path = %self.path, ?err, "renew task ended abnormally"),
        }
        info!(path = %self.path, "relinquished leadership");
    }

    /// Delete the election key if it still holds our id.
    async fn release(&self) {
        let key = self.path.kv_key();
        let released = self
            .client
            .timed(&format!("election release of '{}'", self.path), async {
                match self.store.get(key).await {
                    Ok(Some(owner)) if owner == self.id => {
                        self.store.delete(key).await.map_err(|e| e.to_string())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
        if let Err(err) = released {
            // the key expires on its own after the lease ttl
            warn!(path = %self.path, error = %err, "failed to release election key");
        }
    }
}

/// Keep the election key alive while `lease` is held. Returns whether the
/// key is still ours when the lease ends.
#[allow(clippy::too_many_arguments)]
async fn renew(
    client: NatsClient,
    store: kv::Store,
    path: PathKey,
    id: Bytes,
    mut revision: u64,
    interval: Duration,
    lease: CancellationToken,
    listener: Arc<dyn ElectionListener>,
) -> bool {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = lease.cancelled() => return true,
            _ = ticker.tick() => {}
        }
        let updated = client
            .timed(
                &format!("election renew of '{path}'"),
                store.update(path.kv_key(), id.clone(), revision),
            )
            .await;
        match updated {
            Ok(next) => revision = next,
            Err(err) => {
                warn!(%path, error = %err, "failed to renew leadership lease");
                lease.cancel();
                listener.state_changed(ConnectionState::Lost);
                return false;
            }
        }
    }
}
