//! # node-watcher
//!
//! One [`NodeWatcher`] per monitored node. Each watcher probes its node on a
//! fixed interval and tells the [`NodeManager`] about every change in
//! reachability, and only about changes: consecutive identical outcomes are
//! reported once.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod node;
pub mod probe;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_core::metrics;

pub use crate::node::{Node, NodeManager, NodeState};
pub use crate::probe::{Probe, ProbeError, ProbeResult, RedisPing, TcpProbe};

/// Rejected watcher construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatcherError {
    #[error("poll interval for {0} must be greater than zero")]
    ZeroInterval(Node),
}

/// Polls one node and reports availability transitions.
pub struct NodeWatcher {
    node: Node,
    probe: Arc<dyn Probe>,
    manager: Arc<dyn NodeManager>,
    interval: Duration,
    started: AtomicBool,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeWatcher {
    pub fn new(
        node: Node,
        probe: Arc<dyn Probe>,
        manager: Arc<dyn NodeManager>,
        interval: Duration,
    ) -> Result<Self, WatcherError> {
        if interval.is_zero() {
            return Err(WatcherError::ZeroInterval(node));
        }
        Ok(Self {
            node,
            probe,
            manager,
            interval,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the polling loop is running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.is_cancelled()
    }

    /// Start polling on the current tokio runtime. The first probe runs
    /// immediately. Calling this again, or after [`shutdown`](Self::shutdown),
    /// does nothing.
    pub fn watch(&self) {
        if self.shutdown.is_cancelled() {
            warn!(node = %self.node, "watcher already shut down, not starting");
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            debug!(node = %self.node, "watcher already started");
            return;
        }
        let poll = Poll {
            node: self.node.clone(),
            probe: Arc::clone(&self.probe),
            manager: Arc::clone(&self.manager),
            interval: self.interval,
            shutdown: self.shutdown.clone(),
            stopped: self.stopped.clone(),
        };
        info!(node = %self.node, interval = ?self.interval, "starting node watcher");
        metrics::WATCHED_NODES.inc();
        *self.task.lock() = Some(tokio::spawn(poll.run()));
    }

    /// Stop polling and wait for the loop to exit. A probe in flight is
    /// abandoned and its outcome discarded. Safe to call more than once and
    /// from any task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(err) = task.await {
                    error!(node = %self.node, ?err, "node watcher task failed");
                    self.stopped.cancel();
                }
            }
            // another caller is already awaiting the task
            None => self.stopped.cancelled().await,
        }
    }
}

impl fmt::Debug for NodeWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeWatcher")
            .field("node", &self.node)
            .field("probe", &self.probe)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

/// State owned by the polling loop.
struct Poll {
    node: Node,
    probe: Arc<dyn Probe>,
    manager: Arc<dyn NodeManager>,
    interval: Duration,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl Poll {
    async fn run(self) {
        // marks the watcher stopped even if the loop panics
        let _stopped = self.stopped.clone().drop_guard();
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // nothing reported yet, so the first outcome always is
        let mut reported: Option<NodeState> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                outcome = self.probe.probe(&self.node) => outcome,
            };
            let state = match outcome {
                Ok(()) => NodeState::Available,
                Err(err) => {
                    debug!(node = %self.node, %err, "probe failed");
                    NodeState::Unavailable
                }
            };
            metrics::PROBE_DURATION
                .with_label_values(&[state.as_str()])
                .observe(start.elapsed().as_secs_f64());

            if reported != Some(state) {
                info!(node = %self.node, from = ?reported, to = %state, "node state changed");
                self.manager.notify_state_change(&self.node, state);
                match state {
                    NodeState::Available => metrics::NODE_TRANSITIONS.available.inc(),
                    NodeState::Unavailable => metrics::NODE_TRANSITIONS.unavailable.inc(),
                }
                reported = Some(state);
            }
        }

        debug!(node = %self.node, "node watcher stopped");
        metrics::WATCHED_NODES.dec();
    }
}
