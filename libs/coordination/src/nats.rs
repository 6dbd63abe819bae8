//! Coordination sessions over a NATS JetStream KV bucket.
//!
//! Paths map to KV keys (leading `/` stripped). NATS has no server-side
//! sessions, so a session here is one NATS connection: it expires when the
//! connection is closed for good (transport reconnects exhausted), at which
//! point the registered expiry callbacks fire. Ephemeral nodes are tracked by
//! the session and deleted when it is closed. An expired session can not
//! delete its keys, so they stay behind with no `ephemeral_owner`. Sequential
//! modes are not supported. Keys are flat, so `delete` does not check for
//! children.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_nats::{
    ConnectOptions, Event,
    jetstream::{self, kv},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::paths;
use crate::session::{
    Connector, CreateMode, ExpiryCallback, ServerSet, Session, Stat, WatchCallback, WatchEvent,
    WatchEventKind,
};

/// Default connection timeout if not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport level reconnects async-nats performs before closing the
/// connection, which expires the session.
const MAX_TRANSPORT_RECONNECTS: usize = 10;

/// KV history kept per key.
const KV_HISTORY: i64 = 5;

/// Session ids, unique within the process.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Opens [`NatsSession`]s backed by one KV bucket.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    bucket: String,
    connect_timeout: Duration,
}

impl NatsConnector {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_config(cfg: &config::wire::Coordination) -> Self {
        Self {
            bucket: cfg.bucket.clone(),
            connect_timeout: cfg.connect_timeout,
        }
    }

    async fn store(&self, client: async_nats::Client) -> CoordinationResult<kv::Store> {
        let js = jetstream::new(client);
        match js.get_key_value(self.bucket.clone()).await {
            Ok(store) => Ok(store),
            Err(get_err) => {
                debug!(bucket = %self.bucket, error = %get_err, "creating missing JetStream KV bucket");
                js.create_key_value(kv::Config {
                    bucket: self.bucket.clone(),
                    history: KV_HISTORY,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    CoordinationError::Connection(format!(
                        "failed to create JetStream KV bucket '{}': {create_err} (get error: {get_err})",
                        self.bucket
                    ))
                })
            }
        }
    }
}

/// State shared between a session and its connection event callback.
#[derive(Default)]
struct Lifecycle {
    expired: AtomicBool,
    closed: AtomicBool,
    callbacks: Mutex<Vec<ExpiryCallback>>,
}

impl Lifecycle {
    fn on_event(&self, event: Event) {
        match event {
            Event::Connected => info!("NATS connection established"),
            Event::Disconnected => warn!("NATS connection lost, reconnecting"),
            Event::Closed => {
                warn!("NATS connection closed");
                self.expire();
            }
            other => debug!(?other, "NATS connection event"),
        }
    }

    /// Mark the session expired and run the expiry callbacks, once. A session
    /// that was closed deliberately does not expire.
    fn expire(&self) {
        if self.closed.load(Ordering::Acquire) || self.expired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    fn is_live(&self) -> bool {
        !self.expired.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Session = NatsSession;

    async fn connect(&self, servers: &ServerSet) -> CoordinationResult<NatsSession> {
        let lifecycle = Arc::new(Lifecycle::default());
        let events = Arc::clone(&lifecycle);
        info!(%servers, bucket = %self.bucket, "connecting to NATS");
        let client = ConnectOptions::new()
            .connection_timeout(self.connect_timeout)
            .max_reconnects(MAX_TRANSPORT_RECONNECTS)
            .event_callback(move |event| {
                let events = Arc::clone(&events);
                async move { events.on_event(event) }
            })
            .connect(servers.as_slice().to_vec())
            .await
            .map_err(|e| {
                CoordinationError::Connection(format!("NATS connection to {servers} failed: {e}"))
            })?;
        let store = self.store(client.clone()).await?;

        Ok(NatsSession {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            client,
            store,
            lifecycle,
            ephemerals: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        })
    }
}

/// Strip the leading `/` of a valid, non-root path.
fn key(path: &str) -> CoordinationResult<&str> {
    paths::validate(path)?;
    match path {
        "/" => Err(CoordinationError::BadArguments(
            "the root path has no KV key".into(),
        )),
        _ => Ok(&path[1..]),
    }
}

/// One NATS connection acting as a coordination session.
pub struct NatsSession {
    id: u64,
    client: async_nats::Client,
    store: kv::Store,
    lifecycle: Arc<Lifecycle>,
    ephemerals: Mutex<Vec<String>>,
    token: CancellationToken,
}

impl NatsSession {
    fn check(&self) -> CoordinationResult<()> {
        if self.lifecycle.is_live() {
            Ok(())
        } else {
            Err(CoordinationError::SessionExpired)
        }
    }

    fn connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    /// Classify a failed KV call by the session's state at the time.
    fn op_error(&self, op: &str, path: &str, err: impl fmt::Display) -> CoordinationError {
        if !self.lifecycle.is_live() {
            CoordinationError::SessionExpired
        } else if !self.connected() {
            CoordinationError::NotConnected(format!("{op} {path}: {err}"))
        } else {
            CoordinationError::Protocol(format!("{op} {path} failed: {err}"))
        }
    }

    fn stat_of(&self, key: &str, entry: &kv::Entry) -> Stat {
        Stat {
            version: entry.revision,
            data_length: entry.value.len(),
            ephemeral_owner: self
                .ephemerals
                .lock()
                .iter()
                .any(|owned| owned == key)
                .then_some(self.id),
        }
    }

    async fn live_entry(&self, path: &str, key: &str) -> CoordinationResult<Option<kv::Entry>> {
        let entry = self
            .store
            .entry(key.to_owned())
            .await
            .map_err(|e| self.op_error("read", path, e))?;
        Ok(entry.filter(|entry| matches!(entry.operation, kv::Operation::Put)))
    }
}

#[async_trait]
impl Session for NatsSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn get(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        let key = key(path)?;
        self.check()?;
        match self.live_entry(path, key).await? {
            Some(entry) => Ok((entry.value.to_vec(), self.stat_of(key, &entry))),
            None => Err(CoordinationError::NoNode(path.to_owned())),
        }
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat> {
        let key = key(path)?;
        self.check()?;
        if self.live_entry(path, key).await?.is_none() {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        let revision = self
            .store
            .put(key, Bytes::copy_from_slice(data))
            .await
            .map_err(|e| self.op_error("write", path, e))?;
        Ok(Stat {
            version: revision,
            data_length: data.len(),
            ephemeral_owner: None,
        })
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let key = key(path)?;
        if mode.is_sequential() {
            return Err(CoordinationError::BadArguments(format!(
                "sequential nodes are not supported by the nats backend: {path}"
            )));
        }
        self.check()?;
        match self.store.create(key, Bytes::copy_from_slice(data)).await {
            Ok(_) => {
                if mode.is_ephemeral() {
                    self.ephemerals.lock().push(key.to_owned());
                }
                Ok(path.to_owned())
            }
            Err(err) if matches!(err.kind(), kv::CreateErrorKind::AlreadyExists) => {
                Err(CoordinationError::NodeExists(path.to_owned()))
            }
            Err(err) => Err(self.op_error("create", path, err)),
        }
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        let key = key(path)?;
        self.check()?;
        if self.live_entry(path, key).await?.is_none() {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        self.store
            .delete(key)
            .await
            .map_err(|e| self.op_error("delete", path, e))?;
        self.ephemerals.lock().retain(|owned| owned != key);
        Ok(())
    }

    async fn stat(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        if path == "/" {
            self.check()?;
            return Ok(Some(Stat::default()));
        }
        let key = key(path)?;
        self.check()?;
        Ok(self
            .live_entry(path, key)
            .await?
            .map(|entry| self.stat_of(key, &entry)))
    }

    async fn watch(&self, path: &str, callback: WatchCallback) -> CoordinationResult<()> {
        let key = key(path)?;
        self.check()?;
        let existed = self.live_entry(path, key).await?.is_some();
        let mut updates = self
            .store
            .watch(key)
            .await
            .map_err(|e| self.op_error("watch", path, e))?;

        let token = self.token.clone();
        let path = path.to_owned();
        tokio::spawn(async move {
            let update = tokio::select! {
                _ = token.cancelled() => return,
                update = updates.next() => update,
            };
            match update {
                Some(Ok(entry)) => {
                    let kind = match entry.operation {
                        kv::Operation::Put if existed => WatchEventKind::DataChanged,
                        kv::Operation::Put => WatchEventKind::Created,
                        kv::Operation::Delete | kv::Operation::Purge => WatchEventKind::Deleted,
                    };
                    callback(WatchEvent { path, kind });
                }
                Some(Err(err)) => warn!(?err, path, "KV watch failed"),
                None => debug!(path, "KV watch ended"),
            }
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lifecycle.is_live() && self.connected()
    }

    fn on_expired(&self, callback: ExpiryCallback) -> CoordinationResult<()> {
        self.check()?;
        self.lifecycle.callbacks.lock().push(callback);
        Ok(())
    }

    async fn close(&self) -> CoordinationResult<()> {
        if self.lifecycle.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();
        let ephemerals = std::mem::take(&mut *self.ephemerals.lock());
        let mut result = Ok(());
        for key in ephemerals {
            if let Err(err) = self.store.delete(&key).await {
                warn!(%err, key, "failed to delete ephemeral key");
                result = Err(CoordinationError::Protocol(format!(
                    "failed to delete ephemeral key {key}: {err}"
                )));
            }
        }
        if let Err(err) = self.client.flush().await {
            debug!(%err, "flush on close failed");
        }
        info!("NATS coordination session closed");
        result
    }
}

impl fmt::Debug for NatsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsSession")
            .field("id", &self.id)
            .field("connection_state", &self.client.connection_state())
            .field("expired", &self.lifecycle.expired.load(Ordering::Relaxed))
            .field("closed", &self.lifecycle.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for NatsSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_key() {
        assert_eq!(key("/vigil/nodes/a").unwrap(), "vigil/nodes/a");
        assert!(matches!(key("/"), Err(CoordinationError::BadArguments(_))));
        assert!(matches!(
            key("vigil"),
            Err(CoordinationError::BadArguments(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let cfg: config::wire::Coordination = serde_json::from_str(
            r#"{"servers": ["nats://127.0.0.1:4222"], "bucket": "failover", "connect_timeout": "1s"}"#,
        )
        .unwrap();
        let connector = NatsConnector::from_config(&cfg);
        assert_eq!(connector.bucket, "failover");
        assert_eq!(connector.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_closed_event_expires_once() {
        let lifecycle = Lifecycle::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        lifecycle.callbacks.lock().push(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        lifecycle.on_event(Event::Disconnected);
        assert!(lifecycle.is_live());
        lifecycle.on_event(Event::Closed);
        lifecycle.on_event(Event::Closed);
        assert!(!lifecycle.is_live());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deliberate_close_does_not_expire() {
        let lifecycle = Lifecycle::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        lifecycle.callbacks.lock().push(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        lifecycle.closed.store(true, Ordering::Release);
        lifecycle.on_event(Event::Closed);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
