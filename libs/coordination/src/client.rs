//! Session client with transparent rebuild on expiry.
//!
//! Wraps a [`Connector`] to provide a resilient handle to the coordination
//! service. Every operation that fails with
//! [`CoordinationError::SessionExpired`] rebuilds the session and retries,
//! within a per-call budget. The service can also expire the session on its
//! own; the expiry callback registered on each session schedules the same
//! rebuild without any caller involved.
//!
//! The current session lives behind a lock that is only written while the
//! rebuild lock is held, so readers observe either the old or the new session,
//! never one that is half set up.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use vigil_core::metrics;

use crate::error::{CoordinationError, CoordinationResult};
use crate::paths;
use crate::session::{
    Connector, CreateMode, ExpiryCallback, ServerSet, Session, Stat, WatchCallback, WatchEvent,
};

/// Default number of rebuilds a single operation may trigger.
pub const MAX_RECONNECTS: u32 = 3;

/// Default wait between a rebuild and the retried operation.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Bounds for rebuild-and-retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Rebuilds allowed per operation call.
    pub max_reconnects: u32,
    /// Fixed sleep between a rebuild and the retry.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnects: MAX_RECONNECTS,
            backoff: RECONNECT_BACKOFF,
        }
    }
}

impl From<&config::wire::Coordination> for ReconnectPolicy {
    fn from(cfg: &config::wire::Coordination) -> Self {
        Self {
            max_reconnects: cfg.max_reconnects,
            backoff: cfg.reconnect_backoff,
        }
    }
}

struct Current<S> {
    session: Arc<S>,
    generation: u64,
}

impl<S> Clone for Current<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            generation: self.generation,
        }
    }
}

struct PendingWatch {
    path: String,
    callback: WatchCallback,
}

type WatchRegistry = Arc<Mutex<HashMap<u64, PendingWatch>>>;

struct Inner<C: Connector> {
    connector: C,
    servers: ServerSet,
    policy: ReconnectPolicy,
    current: RwLock<Option<Current<C::Session>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    watches: WatchRegistry,
    next_watch: AtomicU64,
    runtime: Handle,
}

/// Shared handle to the coordination service.
///
/// Cheap to clone; all clones share one session. Provides:
/// - read/write/create/stat/watch primitives
/// - rebuild-and-retry on session expiry, bounded by [`ReconnectPolicy`]
/// - self-healing when the service expires the session asynchronously
/// - re-arming of watches that had not fired when their session was replaced
pub struct SessionClient<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for SessionClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> SessionClient<C> {
    /// Build the client and its first session.
    ///
    /// Fails with [`CoordinationError::Connection`] if the first session can
    /// not be established. Must be called from within a tokio runtime; expiry
    /// driven rebuilds are spawned onto it.
    pub async fn connect(
        connector: C,
        servers: ServerSet,
        policy: ReconnectPolicy,
    ) -> CoordinationResult<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            CoordinationError::Connection(format!("no tokio runtime available: {err}"))
        })?;
        let client = Self {
            inner: Arc::new(Inner {
                connector,
                servers,
                policy,
                current: RwLock::new(None),
                rebuild_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                watches: Arc::new(Mutex::new(HashMap::new())),
                next_watch: AtomicU64::new(0),
                runtime,
            }),
        };
        client.rebuild().await?;
        Ok(client)
    }

    /// Returns the configured servers.
    pub fn servers(&self) -> &ServerSet {
        &self.inner.servers
    }

    /// Returns the reconnect policy.
    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Number of sessions built so far, including the first one.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Returns true if the current session reports a connected state.
    pub fn is_connected(&self) -> bool {
        self.current()
            .map(|current| current.session.is_connected())
            .unwrap_or(false)
    }

    /// Number of watches registered through this client that have not fired.
    pub fn pending_watches(&self) -> usize {
        self.inner.watches.lock().len()
    }

    fn current(&self) -> Option<Current<C::Session>> {
        self.inner.current.read().clone()
    }

    fn checked_current(&self) -> CoordinationResult<Current<C::Session>> {
        self.current()
            .ok_or_else(|| CoordinationError::NotConnected("coordination client closed".into()))
    }

    /// Service-side id of the current session, `None` once closed.
    pub fn session_id(&self) -> Option<u64> {
        self.current().map(|current| current.session.id())
    }

    /// Read a node's data and metadata.
    pub async fn read(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        self.perform("read", path, move |session| async move { session.get(path).await })
            .await
    }

    /// Replace the data of an existing node.
    pub async fn write(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat> {
        self.perform("write", path, move |session| async move {
            session.set(path, data).await
        })
        .await
    }

    /// Create a node, returning the path actually created.
    pub async fn create_node(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.perform("create", path, move |session| async move {
            session.create(path, data, mode).await
        })
        .await
    }

    /// Remove a node that has no children.
    pub async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.perform("delete", path, move |session| async move {
            session.delete(path).await
        })
        .await
    }

    /// Metadata of a node, `None` if it does not exist.
    pub async fn stat(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.perform("stat", path, move |session| async move { session.stat(path).await })
            .await
    }

    /// Register a one-shot watch on `path`.
    ///
    /// The callback runs at most once. If the session is replaced before the
    /// watch fires, the watch is registered again on the new session.
    pub async fn watch<F>(&self, path: &str, callback: F) -> CoordinationResult<()>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        self.inner.watches.lock().insert(
            id,
            PendingWatch {
                path: path.to_owned(),
                callback: Arc::new(callback),
            },
        );
        let armed = arm_watch(&self.inner.watches, id);
        let res = self
            .perform("watch", path, move |session| {
                let armed = Arc::clone(&armed);
                async move { session.watch(path, armed).await }
            })
            .await;
        if res.is_err() {
            self.inner.watches.lock().remove(&id);
        }
        res
    }

    /// Create `path` and any missing ancestors as persistent nodes with empty
    /// data. Nodes that already exist are left alone.
    pub async fn create_path(&self, path: &str) -> CoordinationResult<()> {
        paths::validate(path)?;
        for prefix in paths::ancestors_and_self(path) {
            match self.create_node(prefix, &[], CreateMode::Persistent).await {
                Ok(_) => debug!(path = prefix, "created coordination path"),
                Err(CoordinationError::NodeExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Run `op` against the current session, rebuilding and retrying on
    /// session expiry while the reconnect budget allows. Any other error is
    /// returned immediately.
    ///
    /// The rebuild is skipped if the session that expired was already
    /// replaced while this call waited for the rebuild lock; the retry then
    /// runs against the replacement.
    async fn perform<T, F, Fut>(&self, op: &'static str, path: &str, f: F) -> CoordinationResult<T>
    where
        F: Fn(Arc<C::Session>) -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let mut reconnects = 0u32;
        loop {
            let current = self.checked_current()?;
            match f(current.session).await {
                Err(CoordinationError::SessionExpired) => {
                    metrics::SESSION_EXPIRED.inc();
                    info!(op, path, reconnects, "coordination session expired, rebuilding session");
                    if reconnects >= self.inner.policy.max_reconnects {
                        metrics::SESSION_RETRIES_EXHAUSTED.inc();
                        warn!(
                            op,
                            path,
                            max_reconnects = self.inner.policy.max_reconnects,
                            "reconnect budget exhausted, giving up"
                        );
                        return Err(CoordinationError::SessionExpired);
                    }
                    reconnects += 1;
                    self.rebuild_expired(current.generation).await?;
                    tokio::time::sleep(self.inner.policy.backoff).await;
                }
                res => return res,
            }
        }
    }

    /// Replace the current session with a freshly built one.
    ///
    /// Rebuilds are serialized; concurrent callers queue on the rebuild lock
    /// and each one produces a new session.
    pub async fn rebuild(&self) -> CoordinationResult<()> {
        let session = {
            let _guard = self.inner.rebuild_lock.lock().await;
            self.rebuild_locked().await?
        };
        self.rearm_watches(&session).await;
        Ok(())
    }

    /// Rebuild because session `generation` expired. Does nothing if that
    /// session has already been replaced; returns whether a rebuild ran.
    async fn rebuild_expired(&self, generation: u64) -> CoordinationResult<bool> {
        let session = {
            let _guard = self.inner.rebuild_lock.lock().await;
            let current = self.current().map(|current| current.generation);
            if current != Some(generation) {
                debug!(
                    expired = generation,
                    ?current,
                    "ignoring expiry of a session that was already replaced"
                );
                return Ok(false);
            }
            self.rebuild_locked().await?
        };
        self.rearm_watches(&session).await;
        Ok(true)
    }

    /// Steps that must run under the rebuild lock: discard the stale session,
    /// open and verify the new one, then swap it in.
    async fn rebuild_locked(&self) -> CoordinationResult<Arc<C::Session>> {
        if let Some(stale) = self.current() {
            // the session is discarded either way
            if let Err(err) = stale.session.close().await {
                debug!(
                    ?err,
                    generation = stale.generation,
                    "ignoring error closing stale coordination session"
                );
            }
        }

        let generation = self.inner.generation.load(Ordering::Acquire) + 1;
        let session = match self.open(generation).await {
            Ok(session) => Arc::new(session),
            Err(err) => {
                metrics::SESSION_REBUILD_ERRORS.inc();
                metrics::COORDINATION_CONNECTED.set(0);
                error!(?err, servers = %self.inner.servers, "failed to build coordination session");
                return Err(err);
            }
        };

        *self.inner.current.write() = Some(Current {
            session: Arc::clone(&session),
            generation,
        });
        self.inner.generation.store(generation, Ordering::Release);
        metrics::SESSION_REBUILDS.inc();
        metrics::COORDINATION_CONNECTED.set(1);
        info!(servers = %self.inner.servers, generation, "communicating with coordination servers");
        Ok(session)
    }

    /// Open and verify a new session and hook up its expiry callback.
    async fn open(&self, generation: u64) -> CoordinationResult<C::Session> {
        let servers = &self.inner.servers;
        let session = self
            .inner
            .connector
            .connect(servers)
            .await
            .map_err(|err| connection_error(err, servers))?;

        if !session.is_connected() {
            if let Err(err) = session.close().await {
                debug!(?err, "ignoring error closing unconnected session");
            }
            return Err(CoordinationError::Connection(format!(
                "not in connected state, session: {session:?}"
            )));
        }

        session
            .on_expired(self.expiry_callback(generation))
            .map_err(|err| connection_error(err, servers))?;
        Ok(session)
    }

    fn expiry_callback(&self, generation: u64) -> ExpiryCallback {
        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let runtime = self.inner.runtime.clone();
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let client = SessionClient { inner };
            runtime.spawn(async move {
                warn!(generation, "coordination session expired by service");
                match client.rebuild_expired(generation).await {
                    Ok(true) => metrics::SESSION_EXPIRED.inc(),
                    Ok(false) => {}
                    Err(err) => {
                        metrics::SESSION_EXPIRED.inc();
                        error!(?err, generation, "failed to rebuild expired coordination session");
                    }
                }
            });
        })
    }

    async fn rearm_watches(&self, session: &Arc<C::Session>) {
        let pending = self
            .inner
            .watches
            .lock()
            .iter()
            .map(|(id, watch)| (*id, watch.path.clone()))
            .collect::<Vec<_>>();
        for (id, path) in pending {
            let armed = arm_watch(&self.inner.watches, id);
            if let Err(err) = session.watch(&path, armed).await {
                warn!(?err, path, "failed to re-register watch on new session");
            } else {
                debug!(path, "re-registered watch on new session");
            }
        }
    }

    /// Close the current session. Operations afterwards fail with
    /// [`CoordinationError::NotConnected`].
    pub async fn close(&self) -> CoordinationResult<()> {
        let _guard = self.inner.rebuild_lock.lock().await;
        let current = self.inner.current.write().take();
        metrics::COORDINATION_CONNECTED.set(0);
        match current {
            Some(current) => {
                info!(generation = current.generation, "closing coordination session");
                current.session.close().await
            }
            None => Ok(()),
        }
    }
}

/// Wrap a pending watch so it fires at most once, whichever session delivers
/// the event first.
fn arm_watch(watches: &WatchRegistry, id: u64) -> WatchCallback {
    let watches = Arc::clone(watches);
    Arc::new(move |event| {
        let pending = watches.lock().remove(&id);
        if let Some(pending) = pending {
            (pending.callback)(event);
        }
    })
}

fn connection_error(err: CoordinationError, servers: &ServerSet) -> CoordinationError {
    match err {
        CoordinationError::Connection(_) => err,
        other => CoordinationError::Connection(format!(
            "failed to connect to {servers}, error: {other}"
        )),
    }
}

impl<C: Connector> std::fmt::Debug for SessionClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("servers", &self.inner.servers)
            .field("policy", &self.inner.policy)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
