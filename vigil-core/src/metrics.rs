#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for the coordination client and node watchers
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, register_histogram_vec,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum NodeStateLabel {
        available,
        unavailable,
    }
    pub struct TransitionStats: IntCounter {
        "state" => NodeStateLabel
    }
}

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();
    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    // coordination session metrics

    /// sessions built, including the initial one
    pub static ref SESSION_REBUILDS: IntCounter = register_int_counter!("session_rebuild_count", "count of coordination sessions built").unwrap();
    /// failed attempts to build a session
    pub static ref SESSION_REBUILD_ERRORS: IntCounter = register_int_counter!("session_rebuild_error_count", "count of failed coordination session rebuilds").unwrap();
    /// session expiry seen by an operation or an expiry callback
    pub static ref SESSION_EXPIRED: IntCounter = register_int_counter!("session_expired_count", "count of coordination session expiries observed").unwrap();
    /// operations that gave up after exhausting the reconnect budget
    pub static ref SESSION_RETRIES_EXHAUSTED: IntCounter = register_int_counter!("session_retries_exhausted_count", "count of operations that exhausted their reconnect budget").unwrap();
    /// 1 while the current session reports connected
    pub static ref COORDINATION_CONNECTED: IntGauge = register_int_gauge!("coordination_connected", "coordination session connectivity (1 = connected)").unwrap();

    // node watcher metrics

    /// # of nodes with a running watcher
    pub static ref WATCHED_NODES: IntGauge = register_int_gauge!("watched_nodes", "count of nodes currently watched").unwrap();

    /// histogram of probe times
    pub static ref PROBE_DURATION: HistogramVec = register_histogram_vec!(
        "probe_duration",
        "node probe duration (seconds)",
        &["outcome"]
    )
    .unwrap();

    pub static ref TRANSITION_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "node_transition_counts",
        "Node availability transitions reported",
        &["state"]
    )
    .unwrap();

    /// reported transitions by new state
    pub static ref NODE_TRANSITIONS: TransitionStats = TransitionStats::from(&TRANSITION_COUNT_VEC);

    /// failed writes of node reports to the coordination service
    pub static ref REPORT_WRITE_ERRORS: IntCounter = register_int_counter!("report_write_error_count", "count of node reports that failed to persist").unwrap();
}
