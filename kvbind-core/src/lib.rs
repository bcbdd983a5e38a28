//! # kvbind
//!
//! Keeps in-process values, callbacks and leadership flags in sync with a
//! coordination service. Bindings are registered on a [`Binder`], which reads
//! their initial values, validates the registry, keeps DATA_CHANGE paths
//! live through single-fire watches and runs one leader election per
//! election path.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use kv_coordination;
pub use tokio;
pub use tracing;

pub use crate::binder::Binder;

pub mod binder;
pub mod binding;
pub mod config;
pub mod election;
pub mod env;
pub mod error;
pub mod metrics;
pub mod prelude;
pub mod registry;
pub mod watch;
