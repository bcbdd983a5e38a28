//! [`Coordinator`] backed by NATS JetStream KV.
//!
//! Bound values live in one bucket keyed by the path without its leading
//! `/`; election keys live in a second bucket whose `max_age` is the lease
//! ttl. A single-fire watch is a KV watcher on the key, started before the
//! read so no update can slip between the two, and torn down after the first
//! update it sees.

use std::{fmt, sync::Arc};

use async_nats::jetstream::kv::{self, Operation};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use config::ElectionConfig;

use crate::client::NatsClient;
use crate::coordinator::{
    ConnectionState, Coordinator, ElectionHandle, ElectionListener, Watch, WatchEventKind,
};
use crate::election::{Candidate, CurrentLease, ElectionTiming, forward_states};
use crate::error::CoordinationResult;
use crate::path::PathKey;

/// History kept per key in the buckets.
const KV_HISTORY: i64 = 1;

#[derive(Clone)]
pub struct NatsCoordinator {
    client: NatsClient,
    values: kv::Store,
    elections: kv::Store,
    timing: ElectionTiming,
    candidate_id: Bytes,
}

impl NatsCoordinator {
    /// Open (creating when missing) the values and election buckets on an
    /// already connected client. `candidate_id` identifies this process in
    /// elections.
    pub async fn new(
        client: NatsClient,
        election: &ElectionConfig,
        candidate_id: impl Into<String>,
    ) -> CoordinationResult<Self> {
        let values = client
            .get_or_create_kv_bucket(client.values_bucket(), KV_HISTORY, Default::default())
            .await?;
        let elections = client
            .get_or_create_kv_bucket(client.election_bucket(), KV_HISTORY, election.lease_ttl)
            .await?;
        let candidate_id = candidate_id.into();
        info!(
            values_bucket = client.values_bucket(),
            election_bucket = client.election_bucket(),
            %candidate_id,
            "NATS coordinator ready"
        );
        Ok(Self {
            client,
            values,
            elections,
            timing: ElectionTiming::from(election),
            candidate_id: Bytes::from(candidate_id),
        })
    }

    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

impl fmt::Debug for NatsCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsCoordinator")
            .field("client", &self.client)
            .field("timing", &self.timing)
            .field("candidate_id", &self.candidate_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Coordinator for NatsCoordinator {
    async fn read_value(&self, path: &PathKey) -> CoordinationResult<Option<Bytes>> {
        self.client
            .timed(
                &format!("get of '{path}'"),
                self.values.get(path.kv_key()),
            )
            .await
    }

    async fn read_value_and_watch(
        &self,
        path: &PathKey,
    ) -> CoordinationResult<(Option<Bytes>, Watch)> {
        let mut watcher = self
            .client
            .timed(
                &format!("watch of '{path}'"),
                self.values.watch(path.kv_key()),
            )
            .await?;
        let value = self.read_value(path).await?;

        let (mut trigger, watch) = Watch::channel(path.clone());
        let mut state = self.client.subscribe_state();
        let path = path.clone();
        tokio::spawn(async move {
            let kind = loop {
                let next = tokio::select! {
                    _ = trigger.closed() => return,
                    // dropping the trigger closes the watch, the session is gone
                    _ = state.wait_for(|s| *s == ConnectionState::Lost) => return,
                    next = watcher.next() => next,
                };
                match next {
                    Some(Ok(entry)) => match entry.operation {
                        Operation::Put => break WatchEventKind::DataChanged,
                        _ => break WatchEventKind::DataDeleted,
                    },
                    Some(Err(err)) => {
                        debug!(%path, error = %err, "KV watcher failed");
                        return;
                    }
                    None => return,
                }
            };
            trigger.fire(kind);
        });
        Ok((value, watch))
    }

    async fn write_value(&self, path: &PathKey, value: Bytes) -> CoordinationResult<()> {
        self.client
            .timed(
                &format!("put of '{path}'"),
                self.values.put(path.kv_key(), value),
            )
            .await?;
        Ok(())
    }

    async fn delete_value(&self, path: &PathKey) -> CoordinationResult<()> {
        self.client
            .timed(
                &format!("delete of '{path}'"),
                self.values.delete(path.kv_key()),
            )
            .await
    }

    async fn run_election(
        &self,
        path: &PathKey,
        listener: Arc<dyn ElectionListener>,
    ) -> CoordinationResult<ElectionHandle> {
        let token = CancellationToken::new();
        let current = CurrentLease::default();

        let forward = tokio::spawn(forward_states(
            path.clone(),
            self.client.subscribe_events(),
            Arc::clone(&listener),
            Arc::clone(&current),
            token.clone(),
        ));
        let candidate = tokio::spawn(
            Candidate {
                client: self.client.clone(),
                store: self.elections.clone(),
                path: path.clone(),
                id: self.candidate_id.clone(),
                timing: self.timing,
                listener,
                current,
                token: token.clone(),
            }
            .run(),
        );
        debug!(%path, "NATS election participation started");
        Ok(ElectionHandle::new(
            path.clone(),
            token,
            vec![forward, candidate],
        ))
    }

    fn connection_state(&self) -> ConnectionState {
        self.client.connection_state()
    }
}
