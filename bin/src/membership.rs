//! Registers this instance under `watchers/<id>` as an ephemeral node.
//!
//! The entry disappears with the session that created it, so it is checked
//! on a fixed interval and whenever a watch reports it deleted. An entry left
//! behind by an earlier session (a backend that could not remove it when the
//! session expired) is replaced.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use coordination::{
    Connector, CoordinationError, CreateMode, PathLayout, SessionClient, WatchEventKind,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vigil_core::{
    tokio::{self, sync::Notify, task::JoinHandle},
    tracing::{debug, info, warn},
};

/// Stored at [`PathLayout::watcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub watcher_id: String,
    pub nodes: usize,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Registration<C: Connector> {
    client: SessionClient<C>,
    layout: PathLayout,
    watcher_id: String,
    nodes: usize,
    deleted: Arc<Notify>,
}

impl<C: Connector> Registration<C> {
    pub fn new(
        client: SessionClient<C>,
        layout: PathLayout,
        watcher_id: impl Into<String>,
        nodes: usize,
    ) -> Self {
        Self {
            client,
            layout,
            watcher_id: watcher_id.into(),
            nodes,
            deleted: Arc::new(Notify::new()),
        }
    }

    /// Create the membership entry if the current session does not own it.
    /// Returns true if it was created by this call.
    pub async fn register(&self) -> Result<bool> {
        let path = self.layout.watcher(&self.watcher_id);
        if let Some(stat) = self.client.stat(&path).await? {
            let owner = self.client.session_id();
            if stat.ephemeral_owner.is_some() && stat.ephemeral_owner == owner {
                return Ok(false);
            }
            warn!(
                path,
                stale_owner = ?stat.ephemeral_owner,
                ?owner,
                "replacing membership entry owned by another session"
            );
            match self.client.delete(&path).await {
                Ok(()) | Err(CoordinationError::NoNode(_)) => {}
                Err(err) => return Err(err).with_context(|| format!("failed to delete {path}")),
            }
        }
        self.client
            .create_path(&self.layout.watchers())
            .await
            .context("failed to create watchers path")?;
        let data = serde_json::to_vec(&Membership {
            watcher_id: self.watcher_id.clone(),
            nodes: self.nodes,
            registered_at: Utc::now(),
        })?;
        match self
            .client
            .create_node(&path, &data, CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(CoordinationError::NodeExists(_)) => return Ok(false),
            Err(err) => return Err(err).with_context(|| format!("failed to create {path}")),
        }
        info!(path, "registered watcher membership");

        let deleted = Arc::clone(&self.deleted);
        self.client
            .watch(&path, move |event| {
                if event.kind == WatchEventKind::Deleted {
                    deleted.notify_one();
                }
            })
            .await
            .with_context(|| format!("failed to watch {path}"))?;
        Ok(true)
    }

    /// Keep the entry registered until `token` is cancelled.
    pub fn spawn(self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("membership task stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                    _ = self.deleted.notified() => {
                        info!(watcher_id = %self.watcher_id, "membership entry deleted, registering again");
                    }
                }
                if let Err(err) = self.register().await {
                    warn!(?err, "membership registration failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use coordination::{MemoryService, ReconnectPolicy, ServerSet, Stat};
    use tracing_test::traced_test;

    use super::*;

    async fn registration(service: &MemoryService) -> Registration<MemoryService> {
        let client = SessionClient::connect(
            service.clone(),
            ServerSet::new(["memory"]).unwrap(),
            ReconnectPolicy::default(),
        )
        .await
        .unwrap();
        Registration::new(client, PathLayout::new("/vigil").unwrap(), "w1", 2)
    }

    #[tokio::test]
    async fn test_register_once() {
        let service = MemoryService::new();
        let registration = registration(&service).await;
        assert!(registration.register().await.unwrap());
        assert!(!registration.register().await.unwrap());

        let stat: Stat = registration
            .client
            .stat("/vigil/watchers/w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stat.ephemeral_owner, Some(service.live_sessions()[0]));
        let membership: Membership =
            serde_json::from_slice(&service.data("/vigil/watchers/w1").unwrap()).unwrap();
        assert_eq!(membership.watcher_id, "w1");
        assert_eq!(membership.nodes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregisters_after_session_expiry() {
        let service = MemoryService::new();
        let registration = registration(&service).await;
        let client = registration.client.clone();
        let token = CancellationToken::new();
        let task = registration.spawn(Duration::from_secs(10), token.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = service.live_sessions()[0];
        assert!(service.data("/vigil/watchers/w1").is_some());

        assert!(service.expire_session(first));
        assert!(service.data("/vigil/watchers/w1").is_none());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(client.generation(), 2);
        let stat = client.stat("/vigil/watchers/w1").await.unwrap().unwrap();
        assert_ne!(stat.ephemeral_owner, Some(first));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_replaces_entry_left_by_earlier_session() {
        let service = MemoryService::new();
        let registration = registration(&service).await;
        // a key that outlived its session carries no owner
        registration.client.create_path("/vigil/watchers").await.unwrap();
        registration
            .client
            .create_node("/vigil/watchers/w1", b"{}", CreateMode::Persistent)
            .await
            .unwrap();

        assert!(registration.register().await.unwrap());
        let stat = registration
            .client
            .stat("/vigil/watchers/w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stat.ephemeral_owner, registration.client.session_id());
        assert!(logs_contain("replacing membership entry"));

        // owned now, so the entry goes away with the session
        registration.client.close().await.unwrap();
        assert!(service.data("/vigil/watchers/w1").is_none());
    }
}
