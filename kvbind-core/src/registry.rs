//! # registry
//!
//! Data paths and election paths, kept in disjoint maps. Policies of the
//! bindings sharing a data path are checked by [`BindingRegistry::validate`]
//! before anything is armed.
use std::{collections::BTreeMap, sync::Arc};

use kv_coordination::{Coordinator, PathKey};
use tracing::{debug, info};

use crate::binding::{Binding, CreateStrategy, SubscribeType};
use crate::election::LeaderTarget;
use crate::error::{BindError, BindResult};

/// bindings registered on one data path
#[derive(Debug, Default)]
pub struct PathEntry {
    bindings: Vec<Binding>,
    initial: Option<String>,
}

impl PathEntry {
    /// bindings in registration order
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// value applied by the last initial read of this path
    pub fn initial(&self) -> Option<&str> {
        self.initial.as_deref()
    }

    /// subscribe type of the path, taken from its first binding
    pub fn subscribe(&self) -> SubscribeType {
        self.bindings
            .first()
            .map(Binding::subscribe)
            .unwrap_or_default()
    }

    /// create strategy of the path, taken from its first binding
    pub fn strategy(&self) -> CreateStrategy {
        self.bindings
            .first()
            .map(Binding::strategy)
            .unwrap_or_default()
    }
}

/// Path to binding maps.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    data: BTreeMap<PathKey, PathEntry>,
    leaders: BTreeMap<PathKey, Vec<LeaderTarget>>,
}

/// Decode a stored value. Values are UTF-8 text; anything else is decoded
/// lossily.
pub(crate) fn decode(path: &PathKey, raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_owned(),
        Err(err) => {
            tracing::warn!(%path, ?err, "value is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

impl BindingRegistry {
    /// empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `binding` to `path`. With `is_initial` the path is read now and the
    /// value applied before any watch exists; a missing path is
    /// [`BindError::NoData`].
    pub async fn register(
        &mut self,
        coordinator: &dyn Coordinator,
        path: PathKey,
        binding: Binding,
        is_initial: bool,
    ) -> BindResult<()> {
        let mut initial = None;
        if is_initial {
            let raw = coordinator
                .read_value(&path)
                .await?
                .ok_or_else(|| BindError::NoData { path: path.clone() })?;
            let value = decode(&path, &raw);
            binding.apply(&value).map_err(|source| BindError::Apply {
                path: path.clone(),
                binding: binding.label().to_owned(),
                source,
            })?;
            info!(%path, binding = binding.label(), value, "applied initial value");
            initial = Some(value);
        }

        debug!(
            %path,
            binding = binding.label(),
            subscribe = %binding.subscribe(),
            strategy = %binding.strategy(),
            "registered binding"
        );
        let entry = self.data.entry(path).or_default();
        entry.bindings.push(binding);
        if initial.is_some() {
            entry.initial = initial;
        }
        Ok(())
    }

    /// add a leadership target to the election at `path`
    pub fn register_leader(&mut self, path: PathKey, target: LeaderTarget) {
        debug!(%path, ?target, "registered leadership binding");
        self.leaders.entry(path).or_default().push(target);
    }

    /// Every path with two or more bindings must have a single subscribe
    /// type and a single create strategy.
    pub fn validate(&self) -> BindResult<()> {
        for (path, entry) in &self.data {
            let Some((first, rest)) = entry.bindings.split_first() else {
                continue;
            };
            if rest.iter().any(|b| b.subscribe() != first.subscribe()) {
                return Err(BindError::ConflictingSubscribeType { path: path.clone() });
            }
            if rest.iter().any(|b| b.strategy() != first.strategy()) {
                return Err(BindError::ConflictingCreateStrategy { path: path.clone() });
            }
        }
        Ok(())
    }

    /// visit every data path in path order
    pub fn for_each_path<F>(&self, mut f: F)
    where
        F: FnMut(&PathKey, &PathEntry),
    {
        for (path, entry) in &self.data {
            f(path, entry);
        }
    }

    /// data path entry
    pub fn path(&self, path: &PathKey) -> Option<&PathEntry> {
        self.data.get(path)
    }

    /// election paths with their targets
    pub fn leaders(&self) -> impl Iterator<Item = (&PathKey, Arc<[LeaderTarget]>)> {
        self.leaders
            .iter()
            .map(|(path, targets)| (path, Arc::from(targets.as_slice())))
    }

    /// number of data paths
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// no data paths and no elections
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.leaders.is_empty()
    }
}
