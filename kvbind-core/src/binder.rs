//! # binder
//!
//! Drives the binding engine: registration (with initial reads), validation,
//! then watches and elections, then shutdown.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use kv_coordination::{Coordinator, PathKey, RetryPolicy};
use serde::Serialize;
use tracing::{error, info};

use crate::binding::{
    Bindable, Binding, BoundValue, BoxError, CreateStrategy, Dependencies, SubscribeType,
};
use crate::election::{LeaderElectionCoordinator, LeaderState, LeaderTarget};
use crate::error::{BindError, BindResult};
use crate::metrics;
use crate::registry::BindingRegistry;
use crate::watch::{SyncState, WatchSynchronizer};

/// Owns the registry, the watch synchronizer and the election coordinator.
///
/// Register bindings with `&mut self`, then share the binder (e.g. in an
/// `Arc`) and call [`Binder::start`].
#[derive(Debug)]
pub struct Binder {
    coordinator: Arc<dyn Coordinator>,
    deps: Dependencies,
    registry: BindingRegistry,
    watches: WatchSynchronizer,
    elections: LeaderElectionCoordinator,
    started: AtomicBool,
}

/// point-in-time view of every path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinderSnapshot {
    /// `start` was called
    pub started: bool,
    /// data paths
    pub paths: Vec<PathSnapshot>,
    /// election paths
    pub elections: Vec<ElectionSnapshot>,
}

/// one data path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathSnapshot {
    /// path
    pub path: String,
    /// subscribe type shared by the bindings
    pub subscribe: SubscribeType,
    /// create strategy shared by the bindings
    pub strategy: CreateStrategy,
    /// binding labels
    pub bindings: Vec<String>,
    /// value applied by the initial read
    pub initial: Option<String>,
    /// synchronization state, `None` when the path is not watched
    pub state: Option<SyncState>,
}

/// one election path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectionSnapshot {
    /// election path
    pub path: String,
    /// number of leadership bindings
    pub targets: usize,
    /// participation state
    pub state: LeaderState,
}

fn parse_path(path: impl AsRef<str>) -> BindResult<PathKey> {
    Ok(PathKey::new(path)?)
}

impl Binder {
    /// binder with the default retry policy
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self::with_retry_policy(coordinator, RetryPolicy::default())
    }

    /// binder retrying transient watch failures with `retry`
    pub fn with_retry_policy(coordinator: Arc<dyn Coordinator>, retry: RetryPolicy) -> Self {
        Self {
            watches: WatchSynchronizer::new(Arc::clone(&coordinator), retry),
            elections: LeaderElectionCoordinator::new(Arc::clone(&coordinator)),
            coordinator,
            deps: Dependencies::new(),
            registry: BindingRegistry::new(),
            started: AtomicBool::new(false),
        }
    }

    /// registry `LOOKUP_BY_NAME` bindings resolve against
    pub fn dependencies(&self) -> &Dependencies {
        &self.deps
    }

    fn ensure_not_started(&self) -> BindResult<()> {
        if self.started.load(Ordering::SeqCst) {
            Err(BindError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    /// Bind `slot` to `path`. With `is_initial` the current value is read and
    /// applied now.
    pub async fn register_value_binding<T: Bindable>(
        &mut self,
        path: impl AsRef<str>,
        name: impl Into<String>,
        slot: BoundValue<T>,
        subscribe: SubscribeType,
        strategy: CreateStrategy,
        is_initial: bool,
    ) -> BindResult<()> {
        let binding = Binding::value(name, slot, subscribe, strategy, &self.deps)?;
        self.register_binding(path, binding, is_initial).await
    }

    /// Bind `callback` to `path`; it receives the raw string.
    pub async fn register_invoker_binding<F>(
        &mut self,
        path: impl AsRef<str>,
        name: impl Into<String>,
        callback: F,
        subscribe: SubscribeType,
        strategy: CreateStrategy,
        is_initial: bool,
    ) -> BindResult<()>
    where
        F: Fn(&str) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let binding = Binding::invoker(name, callback, subscribe, strategy);
        self.register_binding(path, binding, is_initial).await
    }

    /// register an already built binding
    pub async fn register_binding(
        &mut self,
        path: impl AsRef<str>,
        binding: Binding,
        is_initial: bool,
    ) -> BindResult<()> {
        self.ensure_not_started()?;
        let path = parse_path(path)?;
        self.registry
            .register(self.coordinator.as_ref(), path, binding, is_initial)
            .await
    }

    /// add a leadership flag or callback to the election at `path`
    pub fn register_leadership_binding(
        &mut self,
        path: impl AsRef<str>,
        target: LeaderTarget,
    ) -> BindResult<()> {
        self.ensure_not_started()?;
        self.registry.register_leader(parse_path(path)?, target);
        Ok(())
    }

    /// Validate the registry, then arm every DATA_CHANGE path and start every
    /// election. Nothing is armed when validation fails. Returns once every
    /// watch is armed; a path that cannot arm fails the start.
    pub async fn start(&self) -> BindResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BindError::AlreadyStarted);
        }
        let now = Instant::now();
        self.registry.validate()?;

        let mut watched = Vec::new();
        let mut res = Ok(());
        self.registry.for_each_path(|path, entry| {
            if res.is_ok() && entry.subscribe() == SubscribeType::DataChange {
                res = self.watches.watch(
                    path.clone(),
                    Arc::from(entry.bindings()),
                    entry.initial().map(str::to_owned),
                );
                watched.push(path.clone());
            }
        });
        // a write landing after start returns must find the watch armed
        for path in &watched {
            if res.is_err() {
                break;
            }
            res = self.watches.wait_armed(path).await;
        }
        if let Err(err) = res {
            error!(?err, "failed to arm watches, stopping");
            if let Err(err) = self.watches.stop().await {
                error!(?err, "watch synchronization failed while stopping");
            }
            return Err(err);
        }

        let mut elections = 0;
        for (path, targets) in self.registry.leaders() {
            if let Err(err) = self.elections.start(path.clone(), targets).await {
                error!(%path, ?err, "failed to start election, stopping");
                self.elections.stop().await;
                if let Err(err) = self.watches.stop().await {
                    error!(?err, "watch synchronization failed while stopping");
                }
                return Err(err);
            }
            elections += 1;
        }

        metrics::START_DURATION.observe(now.elapsed().as_secs_f64());
        info!(
            paths = self.registry.len(),
            watched = watched.len(),
            elections,
            elapsed_ms = now.elapsed().as_millis(),
            "binder started"
        );
        Ok(())
    }

    /// Close every election participation, release leadership holders and
    /// stop every watch. Fails naming the paths whose synchronization failed.
    pub async fn stop(&self) -> BindResult<()> {
        self.elections.stop().await;
        let res = self.watches.stop().await;
        info!("binder stopped");
        res
    }

    /// stop synchronizing one path
    pub async fn stop_path(&self, path: impl AsRef<str>) -> BindResult<()> {
        self.watches.stop_path(&parse_path(path)?).await
    }

    /// Voluntarily give up leadership of `path`. Returns whether it was held.
    pub fn step_down(&self, path: impl AsRef<str>) -> BindResult<bool> {
        self.elections.step_down(&parse_path(path)?)
    }

    /// state of the election participation on `path`
    pub fn leader_state(&self, path: impl AsRef<str>) -> BindResult<Option<LeaderState>> {
        Ok(self.elections.state(&parse_path(path)?))
    }

    /// synchronization state of `path`
    pub fn sync_state(&self, path: impl AsRef<str>) -> BindResult<Option<SyncState>> {
        Ok(self.watches.state(&parse_path(path)?))
    }

    /// per-path synchronization and leadership state
    pub fn snapshot(&self) -> BinderSnapshot {
        let mut paths = Vec::with_capacity(self.registry.len());
        self.registry.for_each_path(|path, entry| {
            paths.push(PathSnapshot {
                path: path.to_string(),
                subscribe: entry.subscribe(),
                strategy: entry.strategy(),
                bindings: entry
                    .bindings()
                    .iter()
                    .map(|b| b.label().to_owned())
                    .collect(),
                initial: entry.initial().map(str::to_owned),
                state: self.watches.state(path),
            });
        });
        let elections = self
            .registry
            .leaders()
            .map(|(path, targets)| ElectionSnapshot {
                path: path.to_string(),
                targets: targets.len(),
                state: self.elections.state(path).unwrap_or(LeaderState::Follower),
            })
            .collect();
        BinderSnapshot {
            started: self.started.load(Ordering::SeqCst),
            paths,
            elections,
        }
    }
}

#[cfg(test)]
mod tests {
    use kv_coordination::MemoryCoordinator;

    use super::*;

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let mut binder = Binder::new(Arc::new(MemoryCoordinator::new()));
        let err = binder
            .register_value_binding(
                "config/limit",
                "limit",
                BoundValue::<i32>::new(),
                SubscribeType::None,
                CreateStrategy::ConstructFromString,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::Coordination(_)));
        assert!(
            binder
                .register_leadership_binding("/", LeaderTarget::flag(BoundValue::new()))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_start_twice() {
        let mut binder = Binder::new(Arc::new(MemoryCoordinator::new()));
        binder.start().await.unwrap();
        assert!(matches!(binder.start().await, Err(BindError::AlreadyStarted)));
        assert!(matches!(
            binder.register_leadership_binding("/member", LeaderTarget::flag(BoundValue::new())),
            Err(BindError::AlreadyStarted)
        ));
        binder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot() {
        let store = Arc::new(MemoryCoordinator::new());
        store.set(&PathKey::new("/config/limit").unwrap(), "10");
        let mut binder = Binder::new(store);
        binder
            .register_value_binding(
                "/config/limit",
                "limit",
                BoundValue::<i32>::new(),
                SubscribeType::None,
                CreateStrategy::ConstructFromString,
                true,
            )
            .await
            .unwrap();
        binder
            .register_leadership_binding("/member", LeaderTarget::flag(BoundValue::new()))
            .unwrap();

        let snapshot = binder.snapshot();
        assert!(!snapshot.started);
        assert_eq!(
            snapshot.paths,
            vec![PathSnapshot {
                path: "/config/limit".into(),
                subscribe: SubscribeType::None,
                strategy: CreateStrategy::ConstructFromString,
                bindings: vec!["limit".into()],
                initial: Some("10".into()),
                state: None,
            }]
        );
        assert_eq!(snapshot.elections[0].state, LeaderState::Follower);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["paths"][0]["strategy"], "CONSTRUCT_FROM_STRING");
        assert_eq!(json["elections"][0]["state"], "FOLLOWER");
    }
}
