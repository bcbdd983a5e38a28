#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! binding engine statistics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGauge, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum WatchEventType {
        changed,
        deleted,
    }
    pub struct WatchEventStats: IntCounter {
        "event" => WatchEventType
    }
}

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// values applied to bindings
    pub static ref VALUES_APPLIED: IntCounter = register_int_counter!("kvbind_values_applied", "count of values applied to bindings").unwrap();
    /// values that failed to apply
    pub static ref APPLY_ERRORS: IntCounter = register_int_counter!("kvbind_apply_errors", "count of values that failed to apply").unwrap();
    /// LOOKUP_BY_NAME values naming no dependency
    pub static ref LOOKUP_MISSES: IntCounter = register_int_counter!("kvbind_lookup_misses", "count of lookups naming no registered dependency").unwrap();

    pub static ref WATCH_EVENT_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "kvbind_watch_events",
        "Watch events by type",
        &["event"]
    )
    .unwrap();

    /// fired watches by event type
    pub static ref WATCH_EVENTS: WatchEventStats = WatchEventStats::from(&WATCH_EVENT_COUNT_VEC);

    /// read-and-watch attempts retried after a transient failure
    pub static ref WATCH_REARM_RETRIES: IntCounter = register_int_counter!("kvbind_watch_rearm_retries", "count of retried watch re-arms").unwrap();
    /// # of paths with a running synchronization task
    pub static ref WATCHED_PATHS: IntGauge = register_int_gauge!("kvbind_watched_paths", "count of synchronized paths").unwrap();

    /// leadership grants
    pub static ref LEADERSHIP_ACQUIRED: IntCounter = register_int_counter!("kvbind_leadership_acquired", "count of leadership grants").unwrap();
    /// leadership releases, revoked or voluntary
    pub static ref LEADERSHIP_RELEASED: IntCounter = register_int_counter!("kvbind_leadership_released", "count of leadership releases").unwrap();
    /// # of election paths we currently lead
    pub static ref LEADER_PATHS: IntGauge = register_int_gauge!("kvbind_leader_paths", "count of election paths currently led").unwrap();

    /// time taken by `Binder::start`
    pub static ref START_DURATION: Histogram = register_histogram!(
        "kvbind_start_duration",
        "binder start duration (seconds)"
    )
    .unwrap();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();
}
