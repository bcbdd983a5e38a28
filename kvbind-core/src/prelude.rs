//! kvbind prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    binder::{Binder, BinderSnapshot},
    binding::{Bindable, Binding, BoundValue, CreateStrategy, Dependencies, SubscribeType},
    election::{LeaderState, LeaderTarget},
    error::{BindError, BindResult},
    kv_coordination::{Coordinator, MemoryCoordinator, PathKey},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
    watch::SyncState,
};

pub use std::sync::Arc;
