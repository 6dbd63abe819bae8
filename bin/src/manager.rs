//! Manager-side sink for watcher notifications.
//!
//! Watchers call [`CoordinatedManager::notify_state_change`] from their
//! polling loops, so it only records the state and queues a report. Only the
//! latest unpersisted report per node is kept, so the queue never fills. A
//! single task drains it through the shared coordination client and keeps
//! retrying failed writes until they land or a newer report replaces them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use coordination::{Connector, CoordinationError, CreateMode, PathLayout, SessionClient};
use external_api::NodeStates;
use node_watcher::{Node, NodeManager, NodeState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vigil_core::{
    metrics,
    tokio::{self, sync::Notify},
    tracing::{debug, info, warn},
};

/// first wait before failed reports are written again
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// upper bound for the doubling retry wait
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// What one watcher last observed about one node, as stored at
/// [`PathLayout::node_report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: Node,
    pub state: NodeState,
    pub watcher_id: String,
    pub reported_at: DateTime<Utc>,
}

/// Latest unpersisted report per node.
#[derive(Debug, Default)]
pub struct ReportQueue {
    pending: Mutex<HashMap<Node, NodeReport>>,
    ready: Notify,
    closed: AtomicBool,
}

impl ReportQueue {
    fn push(&self, report: NodeReport) {
        self.pending.lock().insert(report.node.clone(), report);
        self.ready.notify_one();
    }

    /// Put back a report that failed to persist unless a newer one arrived.
    fn retry(&self, report: NodeReport) {
        self.pending
            .lock()
            .entry(report.node.clone())
            .or_insert(report);
    }

    fn take(&self) -> Vec<NodeReport> {
        self.pending.lock().drain().map(|(_, report)| report).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reports waiting to be persisted.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct CoordinatedManager {
    watcher_id: String,
    states: NodeStates,
    queue: Arc<ReportQueue>,
}

impl CoordinatedManager {
    /// The queue closes when the manager is dropped.
    pub fn new(watcher_id: impl Into<String>, states: NodeStates) -> (Self, Arc<ReportQueue>) {
        let queue = Arc::new(ReportQueue::default());
        (
            Self {
                watcher_id: watcher_id.into(),
                states,
                queue: Arc::clone(&queue),
            },
            queue,
        )
    }
}

impl NodeManager for CoordinatedManager {
    fn notify_state_change(&self, node: &Node, state: NodeState) {
        self.states.write().insert(node.clone(), state);
        self.queue.push(NodeReport {
            node: node.clone(),
            state,
            watcher_id: self.watcher_id.clone(),
            reported_at: Utc::now(),
        });
    }
}

impl Drop for CoordinatedManager {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Write queued reports until the queue closes. Failed writes are retried
/// with a doubling backoff; once closed, pending reports get one last
/// attempt.
pub async fn persist_reports<C: Connector>(
    client: SessionClient<C>,
    layout: PathLayout,
    queue: Arc<ReportQueue>,
) {
    let mut backoff = RETRY_BACKOFF;
    loop {
        let closed = queue.is_closed();
        let mut failed = 0usize;
        for report in queue.take() {
            match write_report(&client, &layout, &report).await {
                Ok(path) => debug!(path, state = %report.state, "node report persisted"),
                Err(err) => {
                    metrics::REPORT_WRITE_ERRORS.inc();
                    warn!(node = %report.node, state = %report.state, ?err, "failed to persist node report");
                    queue.retry(report);
                    failed += 1;
                }
            }
        }
        if closed {
            if failed > 0 {
                warn!(reports = failed, "node reports not persisted before shutdown");
            }
            break;
        }
        if failed == 0 {
            backoff = RETRY_BACKOFF;
            queue.ready.notified().await;
        } else {
            debug!(?backoff, reports = failed, "retrying node reports");
            tokio::select! {
                _ = queue.ready.notified() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }
    }
    info!("report queue closed, persistence stopped");
}

/// Store `report` at its path, creating the node on first use.
pub async fn write_report<C: Connector>(
    client: &SessionClient<C>,
    layout: &PathLayout,
    report: &NodeReport,
) -> Result<String> {
    let (host, port) = (report.node.host(), report.node.port());
    let path = layout.node_report(host, port, &report.watcher_id);
    let data = serde_json::to_vec(report).context("failed to encode node report")?;

    match client.write(&path, &data).await {
        Ok(_) => return Ok(path),
        Err(CoordinationError::NoNode(_)) => {}
        Err(err) => return Err(err).with_context(|| format!("failed to write {path}")),
    }
    client
        .create_path(&layout.node(host, port))
        .await
        .with_context(|| format!("failed to create parent of {path}"))?;
    match client.create_node(&path, &data, CreateMode::Persistent).await {
        Ok(_) => {}
        // raced with another writer for the same report
        Err(CoordinationError::NodeExists(_)) => {
            client
                .write(&path, &data)
                .await
                .with_context(|| format!("failed to write {path}"))?;
        }
        Err(err) => return Err(err).with_context(|| format!("failed to create {path}")),
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use coordination::{MemoryService, ReconnectPolicy, ServerSet};

    use super::*;

    async fn client(service: &MemoryService) -> SessionClient<MemoryService> {
        SessionClient::connect(
            service.clone(),
            ServerSet::new(["memory"]).unwrap(),
            ReconnectPolicy::default(),
        )
        .await
        .unwrap()
    }

    fn stored(service: &MemoryService, path: &str) -> NodeReport {
        serde_json::from_slice(&service.data(path).expect("report stored")).unwrap()
    }

    #[tokio::test]
    async fn test_notify_records_and_persists() {
        let service = MemoryService::new();
        let layout = PathLayout::new("/vigil").unwrap();
        let states = NodeStates::default();
        let (manager, queue) = CoordinatedManager::new("watcher-a", states.clone());
        let task = tokio::spawn(persist_reports(client(&service).await, layout.clone(), queue));

        let node = Node::new("10.0.0.1", 6379);
        manager.notify_state_change(&node, NodeState::Available);
        manager.notify_state_change(&node, NodeState::Unavailable);
        assert_eq!(states.read().get(&node), Some(&NodeState::Unavailable));

        drop(manager);
        task.await.unwrap();

        let report = stored(&service, "/vigil/nodes/10.0.0.1_6379/watcher-a");
        assert_eq!(report.node, node);
        assert_eq!(report.state, NodeState::Unavailable);
        assert_eq!(report.watcher_id, "watcher-a");
        assert_eq!(service.children("/vigil/nodes"), vec!["10.0.0.1_6379"]);
    }

    #[tokio::test]
    async fn test_queue_keeps_latest_report_per_node() {
        let states = NodeStates::default();
        let (manager, queue) = CoordinatedManager::new("watcher-a", states.clone());
        let node = Node::new("10.0.0.1", 6379);
        for i in 0..2048 {
            manager.notify_state_change(&node, NodeState::from_reachable(i % 2 == 0));
        }
        manager.notify_state_change(&Node::new("10.0.0.2", 6379), NodeState::Available);
        assert_eq!(states.read().len(), 2);
        assert_eq!(queue.len(), 2);
        let latest = queue
            .take()
            .into_iter()
            .find(|report| report.node == node)
            .unwrap();
        assert_eq!(latest.state, NodeState::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_retried_without_new_transition() {
        let service = MemoryService::new();
        let layout = PathLayout::new("/vigil").unwrap();
        let (manager, queue) = CoordinatedManager::new("watcher-a", NodeStates::default());
        let task = tokio::spawn(persist_reports(
            client(&service).await,
            layout,
            Arc::clone(&queue),
        ));
        let path = "/vigil/nodes/10.0.0.1_6379/watcher-a";
        let node = Node::new("10.0.0.1", 6379);

        manager.notify_state_change(&node, NodeState::Available);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stored(&service, path).state, NodeState::Available);

        service.fail_next(1, CoordinationError::Protocol("boom".into()));
        manager.notify_state_change(&node, NodeState::Unavailable);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stored(&service, path).state, NodeState::Available);
        assert_eq!(queue.len(), 1);

        // the watcher stays quiet, the retry alone fixes the record
        tokio::time::sleep(RETRY_BACKOFF).await;
        assert_eq!(stored(&service, path).state, NodeState::Unavailable);
        assert!(queue.is_empty());

        drop(manager);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_newer_report() {
        let service = MemoryService::new();
        let layout = PathLayout::new("/vigil").unwrap();
        let (manager, queue) = CoordinatedManager::new("watcher-a", NodeStates::default());
        let task = tokio::spawn(persist_reports(
            client(&service).await,
            layout,
            Arc::clone(&queue),
        ));
        let path = "/vigil/nodes/10.0.0.1_6379/watcher-a";
        let node = Node::new("10.0.0.1", 6379);

        // several failures in a row back off, then the latest state lands
        service.fail_next(3, CoordinationError::Protocol("boom".into()));
        manager.notify_state_change(&node, NodeState::Available);
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.notify_state_change(&node, NodeState::Unavailable);
        tokio::time::sleep(RETRY_BACKOFF * 8).await;
        assert_eq!(stored(&service, path).state, NodeState::Unavailable);
        assert!(queue.is_empty());

        drop(manager);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_stops_when_closed_despite_failures() {
        let service = MemoryService::new();
        let layout = PathLayout::new("/vigil").unwrap();
        let (manager, queue) = CoordinatedManager::new("watcher-a", NodeStates::default());
        let task = tokio::spawn(persist_reports(
            client(&service).await,
            layout,
            Arc::clone(&queue),
        ));

        service.fail_next(100, CoordinationError::Protocol("boom".into()));
        manager.notify_state_change(&Node::new("10.0.0.1", 6379), NodeState::Available);
        drop(manager);
        task.await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_report_survives_expiry() {
        let service = MemoryService::new();
        let client = client(&service).await;
        let layout = PathLayout::new("/vigil").unwrap();
        let report = NodeReport {
            node: Node::new("redis-a", 6380),
            state: NodeState::Available,
            watcher_id: "w1".into(),
            reported_at: Utc::now(),
        };
        write_report(&client, &layout, &report).await.unwrap();

        service.fail_next(1, CoordinationError::SessionExpired);
        let report = NodeReport {
            state: NodeState::Unavailable,
            ..report
        };
        let path = write_report(&client, &layout, &report).await.unwrap();
        assert_eq!(stored(&service, &path).state, NodeState::Unavailable);
        assert_eq!(client.generation(), 2);
    }

    #[tokio::test]
    async fn test_write_report_error() {
        let service = MemoryService::new();
        let client = client(&service).await;
        let layout = PathLayout::new("/vigil").unwrap();
        let report = NodeReport {
            node: Node::new("redis-a", 6380),
            state: NodeState::Available,
            watcher_id: "w1".into(),
            reported_at: Utc::now(),
        };
        service.fail_next(1, CoordinationError::Protocol("boom".into()));
        let err = write_report(&client, &layout, &report).await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }
}
