//! # kv-coordination
//!
//! Coordination-service access for the binding engine.
//!
//! This library provides:
//! - **[`Coordinator`]**, the contract the binding engine is written against:
//!   reads, atomic read-and-watch with single-fire watches, and a
//!   leader-election recipe with connection state callbacks.
//! - **[`NatsCoordinator`]**, an implementation on NATS JetStream KV with a
//!   lease-based election.
//! - **[`MemoryCoordinator`]**, an in-process implementation used by tests and
//!   the `memory` backend, with hooks to simulate external writers and
//!   connection state transitions.
//! - **Connection manager** with optional auth/encryption mode support
//!   and connection state observability.
//! - **[`RetryPolicy`]** for transient failures.

pub mod client;
pub mod coordinator;
mod election;
pub mod error;
pub mod kv;
pub mod memory;
pub mod path;
pub mod retry;

pub use client::NatsClient;
pub use coordinator::{
    ConnectionState, Coordinator, ElectionHandle, ElectionListener, LeadershipLease, Watch,
    WatchEvent, WatchEventKind, WatchTrigger,
};
pub use error::{CoordinationError, CoordinationResult};
pub use kv::NatsCoordinator;
pub use memory::MemoryCoordinator;
pub use path::PathKey;
pub use retry::RetryPolicy;
