//! binding engine errors
use kv_coordination::{CoordinationError, PathKey};
use thiserror::Error;

use crate::binding::{ApplyError, CreateStrategy};

/// result alias for the binding engine
pub type BindResult<T> = Result<T, BindError>;

/// Everything that can go wrong registering, starting or running bindings.
#[derive(Debug, Error)]
pub enum BindError {
    /// bindings on one path disagree on their subscribe type
    #[error("conflicting subscribe types on path {path}")]
    ConflictingSubscribeType {
        /// offending path
        path: PathKey,
    },
    /// bindings on one path disagree on their create strategy
    #[error("conflicting create strategies on path {path}")]
    ConflictingCreateStrategy {
        /// offending path
        path: PathKey,
    },
    /// CONSTRUCT_FROM_STRING on a type without a string constructor
    #[error("binding {label}: {type_name} has no string constructor")]
    NoConstructor {
        /// binding label
        label: String,
        /// target type
        type_name: &'static str,
    },
    /// strategy that cannot produce a value for the target
    #[error("binding {label}: create strategy {strategy} is not supported for value bindings")]
    UnsupportedStrategy {
        /// binding label
        label: String,
        /// rejected strategy
        strategy: CreateStrategy,
    },
    /// initial read found nothing at the path
    #[error("no data found on path {path}")]
    NoData {
        /// path that was read
        path: PathKey,
    },
    /// coordination service failure, including invalid paths
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    /// a value could not be applied to a binding
    #[error("failed to apply value on path {path} to {binding}: {source}")]
    Apply {
        /// path the value came from
        path: PathKey,
        /// binding label
        binding: String,
        /// cause
        source: ApplyError,
    },
    /// the binder was already started
    #[error("binder already started")]
    AlreadyStarted,
    /// path has no election participation
    #[error("no election registered on path {path}")]
    UnknownElection {
        /// requested path
        path: PathKey,
    },
    /// path already has a running synchronization
    #[error("path {path} is already watched")]
    AlreadyWatched {
        /// requested path
        path: PathKey,
    },
    /// synchronization ended with an error on these paths, see the logs
    #[error("synchronization failed on {}", join(.paths))]
    SyncFailed {
        /// failed paths
        paths: Vec<PathKey>,
    },
}

fn join(paths: &[PathKey]) -> String {
    paths
        .iter()
        .map(PathKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
