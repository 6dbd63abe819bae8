//! In-process coordination service.
//!
//! A hierarchical store with sessions, ephemeral and sequential nodes and
//! one-shot watches. State is lost when the last handle is dropped, so this
//! backs tests and single host runs. Faults (expired sessions, failing
//! operations, refused connects, failing closes) can be injected to exercise
//! the recovery paths of [`SessionClient`](crate::SessionClient).

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{CoordinationError, CoordinationResult};
use crate::paths;
use crate::session::{
    Connector, CreateMode, ExpiryCallback, ServerSet, Session, Stat, WatchCallback, WatchEvent,
    WatchEventKind,
};

type Fired = Vec<(WatchCallback, WatchEvent)>;

#[derive(Debug, Clone)]
struct Znode {
    data: Vec<u8>,
    version: u64,
    ephemeral_owner: Option<u64>,
}

impl Znode {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            data_length: self.data.len(),
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

#[derive(Default)]
struct SessionEntry {
    expiry_callbacks: Vec<ExpiryCallback>,
}

#[derive(Default)]
struct Faults {
    pending: VecDeque<CoordinationError>,
    refuse_connect: bool,
    half_open: bool,
    fail_close: bool,
    connect_delay: Duration,
}

/// Counts a connect as in progress until dropped, including when the
/// connect future is cancelled.
struct InFlight {
    state: Arc<Mutex<State>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.lock().counters.in_flight_connects -= 1;
    }
}

#[derive(Default)]
struct Counters {
    connects: usize,
    closes: usize,
    in_flight_connects: usize,
    max_in_flight_connects: usize,
}

struct State {
    nodes: BTreeMap<String, Znode>,
    sessions: HashMap<u64, SessionEntry>,
    watches: HashMap<String, Vec<(u64, WatchCallback)>>,
    sequences: HashMap<String, u64>,
    next_session: u64,
    faults: Faults,
    counters: Counters,
}

impl Default for State {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_owned(),
            Znode {
                data: Vec::new(),
                version: 0,
                ephemeral_owner: None,
            },
        );
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: HashMap::new(),
            sequences: HashMap::new(),
            next_session: 1,
            faults: Faults::default(),
            counters: Counters::default(),
        }
    }
}

impl State {
    /// Take the one-shot watches on `path`.
    fn trigger(&mut self, path: &str, kind: WatchEventKind, fired: &mut Fired) {
        if let Some(watches) = self.watches.remove(path) {
            for (_, callback) in watches {
                fired.push((
                    callback,
                    WatchEvent {
                        path: path.to_owned(),
                        kind,
                    },
                ));
            }
        }
    }

    /// Drop a session with everything it owns. Returns its expiry callbacks
    /// and the watches fired by removing its ephemeral nodes.
    fn end_session(&mut self, id: u64) -> Option<(Vec<ExpiryCallback>, Fired)> {
        let entry = self.sessions.remove(&id)?;
        for watches in self.watches.values_mut() {
            watches.retain(|(owner, _)| *owner != id);
        }
        self.watches.retain(|_, watches| !watches.is_empty());

        let owned = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();
        let mut fired = Vec::new();
        for path in owned {
            self.nodes.remove(&path);
            trace!(path, session = id, "removed ephemeral node");
            self.trigger(&path, WatchEventKind::Deleted, &mut fired);
        }
        Some((entry.expiry_callbacks, fired))
    }
}

fn fire(fired: Fired) {
    for (callback, event) in fired {
        callback(event);
    }
}

/// Handle to an in-process coordination service. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryService {
    state: Arc<Mutex<State>>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` session operations with `err`, whichever session
    /// issues them.
    pub fn fail_next(&self, n: usize, err: CoordinationError) {
        let mut state = self.state.lock();
        state
            .faults
            .pending
            .extend(std::iter::repeat_n(err, n));
    }

    /// Refuse new sessions.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().faults.refuse_connect = refuse;
    }

    /// Hand out sessions that report themselves as not connected.
    pub fn half_open_connections(&self, half_open: bool) {
        self.state.lock().faults.half_open = half_open;
    }

    /// Make `close` return an error (the session is still discarded).
    pub fn fail_closes(&self, fail: bool) {
        self.state.lock().faults.fail_close = fail;
    }

    /// Delay every connect by `delay`.
    pub fn connect_delay(&self, delay: Duration) {
        self.state.lock().faults.connect_delay = delay;
    }

    /// Expire a session as the service would: its ephemeral nodes and
    /// watches go away and its expiry callbacks fire. Returns false if the
    /// session was not live.
    pub fn expire_session(&self, id: u64) -> bool {
        let ended = self.state.lock().end_session(id);
        match ended {
            Some((callbacks, fired)) => {
                debug!(session = id, "expiring session");
                fire(fired);
                for callback in callbacks {
                    callback();
                }
                true
            }
            None => false,
        }
    }

    /// Ids of live sessions, ascending.
    pub fn live_sessions(&self) -> Vec<u64> {
        let mut ids = self.state.lock().sessions.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Sessions handed out so far.
    pub fn connects(&self) -> usize {
        self.state.lock().counters.connects
    }

    /// Sessions closed so far.
    pub fn closes(&self) -> usize {
        self.state.lock().counters.closes
    }

    /// Highest number of connects that were in progress at the same time.
    pub fn max_concurrent_connects(&self) -> usize {
        self.state.lock().counters.max_in_flight_connects
    }

    /// Data stored at `path`, bypassing sessions.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Direct children of `path`, by name.
    pub fn children(&self, path: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .nodes
            .keys()
            .filter(|candidate| paths::parent(candidate) == Some(path))
            .filter_map(|candidate| candidate.rsplit('/').next().map(str::to_owned))
            .collect()
    }
}

impl fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryService")
            .field("nodes", &state.nodes.len())
            .field("sessions", &state.sessions.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MemoryService {
    type Session = MemorySession;

    async fn connect(&self, servers: &ServerSet) -> CoordinationResult<MemorySession> {
        let (delay, in_flight) = {
            let mut state = self.state.lock();
            if state.faults.refuse_connect {
                return Err(CoordinationError::Connection(format!(
                    "connection refused by {servers}"
                )));
            }
            state.counters.in_flight_connects += 1;
            state.counters.max_in_flight_connects = state
                .counters
                .max_in_flight_connects
                .max(state.counters.in_flight_connects);
            let in_flight = InFlight {
                state: Arc::clone(&self.state),
            };
            (state.faults.connect_delay, in_flight)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        drop(in_flight);

        let mut state = self.state.lock();
        state.counters.connects += 1;
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, SessionEntry::default());
        debug!(session = id, %servers, "opened memory session");
        Ok(MemorySession {
            id,
            connected: !state.faults.half_open,
            service: self.clone(),
        })
    }
}

/// One session with a [`MemoryService`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    connected: bool,
    service: MemoryService,
}

impl MemorySession {
    /// Lock the service state for an operation, applying injected faults and
    /// session liveness.
    fn begin(&self) -> CoordinationResult<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.service.state.lock();
        if let Some(err) = state.faults.pending.pop_front() {
            return Err(err);
        }
        if !state.sessions.contains_key(&self.id) {
            return Err(CoordinationError::SessionExpired);
        }
        if !self.connected {
            return Err(CoordinationError::NotConnected(format!(
                "session {} has no server connection",
                self.id
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn get(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        paths::validate(path)?;
        let state = self.begin()?;
        state
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat()))
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat> {
        paths::validate(path)?;
        let mut fired = Vec::new();
        let stat = {
            let mut state = self.begin()?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
            node.data = data.to_vec();
            node.version += 1;
            let stat = node.stat();
            state.trigger(path, WatchEventKind::DataChanged, &mut fired);
            stat
        };
        fire(fired);
        Ok(stat)
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        paths::validate(path)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists(path.to_owned()));
        }
        let mut fired = Vec::new();
        let created = {
            let mut state = self.begin()?;
            let parent = paths::parent(path).unwrap_or("/").to_owned();
            match state.nodes.get(&parent) {
                None => return Err(CoordinationError::NoNode(parent)),
                Some(node) if node.ephemeral_owner.is_some() => {
                    return Err(CoordinationError::BadArguments(format!(
                        "ephemeral node {parent} can not have children"
                    )));
                }
                Some(_) => {}
            }

            let created = if mode.is_sequential() {
                let seq = state.sequences.entry(parent).or_insert(0);
                let created = format!("{path}{seq:010}");
                *seq += 1;
                created
            } else {
                path.to_owned()
            };
            if state.nodes.contains_key(&created) {
                return Err(CoordinationError::NodeExists(created));
            }
            state.nodes.insert(
                created.clone(),
                Znode {
                    data: data.to_vec(),
                    version: 0,
                    ephemeral_owner: mode.is_ephemeral().then_some(self.id),
                },
            );
            state.trigger(&created, WatchEventKind::Created, &mut fired);
            created
        };
        fire(fired);
        Ok(created)
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        paths::validate(path)?;
        if path == "/" {
            return Err(CoordinationError::BadArguments(
                "the root node can not be deleted".into(),
            ));
        }
        let mut fired = Vec::new();
        {
            let mut state = self.begin()?;
            if !state.nodes.contains_key(path) {
                return Err(CoordinationError::NoNode(path.to_owned()));
            }
            if state
                .nodes
                .keys()
                .any(|candidate| paths::parent(candidate) == Some(path))
            {
                return Err(CoordinationError::BadArguments(format!(
                    "node {path} has children"
                )));
            }
            state.nodes.remove(path);
            state.trigger(path, WatchEventKind::Deleted, &mut fired);
        }
        fire(fired);
        Ok(())
    }

    async fn stat(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        paths::validate(path)?;
        let state = self.begin()?;
        Ok(state.nodes.get(path).map(Znode::stat))
    }

    async fn watch(&self, path: &str, callback: WatchCallback) -> CoordinationResult<()> {
        paths::validate(path)?;
        let mut state = self.begin()?;
        state
            .watches
            .entry(path.to_owned())
            .or_default()
            .push((self.id, callback));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.service.state.lock().sessions.contains_key(&self.id)
    }

    fn on_expired(&self, callback: ExpiryCallback) -> CoordinationResult<()> {
        let mut state = self.service.state.lock();
        let entry = state
            .sessions
            .get_mut(&self.id)
            .ok_or(CoordinationError::SessionExpired)?;
        entry.expiry_callbacks.push(callback);
        Ok(())
    }

    async fn close(&self) -> CoordinationResult<()> {
        let (ended, fail) = {
            let mut state = self.service.state.lock();
            let ended = state.end_session(self.id);
            if ended.is_some() {
                state.counters.closes += 1;
            }
            (ended, state.faults.fail_close)
        };
        // expiry callbacks are not run for a deliberate close
        if let Some((_, fired)) = ended {
            debug!(session = self.id, "closed memory session");
            fire(fired);
        }
        if fail {
            return Err(CoordinationError::Protocol(format!(
                "failed to close session {}",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    async fn session(service: &MemoryService) -> MemorySession {
        service
            .connect(&ServerSet::new(["memory"]).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_crud() {
        let service = MemoryService::new();
        let s = session(&service).await;

        assert_eq!(
            s.create("/a", b"x", CreateMode::Persistent).await.unwrap(),
            "/a"
        );
        assert!(matches!(
            s.create("/a", b"x", CreateMode::Persistent).await,
            Err(CoordinationError::NodeExists(_))
        ));
        assert!(matches!(
            s.create("/missing/child", b"", CreateMode::Persistent).await,
            Err(CoordinationError::NoNode(parent)) if parent == "/missing"
        ));

        let stat = s.set("/a", b"yz").await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(stat.data_length, 2);
        let (data, stat) = s.get("/a").await.unwrap();
        assert_eq!(data, b"yz");
        assert_eq!(stat.version, 1);

        assert!(s.stat("/b").await.unwrap().is_none());
        assert!(matches!(s.set("/b", b"").await, Err(CoordinationError::NoNode(_))));
        assert!(matches!(
            s.get("relative").await,
            Err(CoordinationError::BadArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_sequential_nodes() {
        let service = MemoryService::new();
        let s = session(&service).await;
        s.create("/q", b"", CreateMode::Persistent).await.unwrap();

        let first = s
            .create("/q/item-", b"", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = s
            .create("/q/item-", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/q/item-0000000000");
        assert_eq!(second, "/q/item-0000000001");
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_follow_session() {
        let service = MemoryService::new();
        let owner = session(&service).await;
        let other = session(&service).await;

        owner
            .create("/e", b"", CreateMode::Ephemeral)
            .await
            .unwrap();
        let stat = other.stat("/e").await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, Some(owner.id()));
        assert!(matches!(
            owner.create("/e/child", b"", CreateMode::Persistent).await,
            Err(CoordinationError::BadArguments(_))
        ));

        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deleted);
        other
            .watch(
                "/e",
                Arc::new(move |event| {
                    assert_eq!(event.kind, WatchEventKind::Deleted);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        owner.close().await.unwrap();
        assert!(other.stat("/e").await.unwrap().is_none());
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert!(matches!(
            owner.get("/").await,
            Err(CoordinationError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_expire_session_runs_callbacks() {
        let service = MemoryService::new();
        let s = session(&service).await;
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&expired);
        s.on_expired(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(s.is_connected());
        assert!(service.expire_session(s.id()));
        assert!(!service.expire_session(s.id()));
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(!s.is_connected());
        assert!(matches!(
            s.stat("/").await,
            Err(CoordinationError::SessionExpired)
        ));
        assert!(s.on_expired(Box::new(|| {})).is_err());
    }

    #[tokio::test]
    async fn test_close_does_not_run_expiry_callbacks() {
        let service = MemoryService::new();
        let s = session(&service).await;
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&expired);
        s.on_expired(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        s.close().await.unwrap();
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        assert_eq!(service.closes(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let service = MemoryService::new();
        let s = session(&service).await;
        service.fail_next(2, CoordinationError::Protocol("boom".into()));
        assert!(s.stat("/").await.is_err());
        assert!(s.get("/").await.is_err());
        assert!(s.stat("/").await.is_ok());

        service.half_open_connections(true);
        let half = session(&service).await;
        assert!(!half.is_connected());
        assert!(matches!(
            half.stat("/").await,
            Err(CoordinationError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_children() {
        let service = MemoryService::new();
        let s = session(&service).await;
        s.create("/p", b"", CreateMode::Persistent).await.unwrap();
        s.create("/p/a", b"", CreateMode::Persistent).await.unwrap();
        s.create("/p/b", b"", CreateMode::Persistent).await.unwrap();
        s.create("/p/a/deep", b"", CreateMode::Persistent)
            .await
            .unwrap();
        let mut children = service.children("/p");
        children.sort();
        assert_eq!(children, vec!["a", "b"]);
        assert_eq!(service.data("/p/a"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_delete() {
        let service = MemoryService::new();
        let s = session(&service).await;
        s.create("/d", b"", CreateMode::Persistent).await.unwrap();
        s.create("/d/child", b"", CreateMode::Persistent)
            .await
            .unwrap();

        assert!(matches!(
            s.delete("/d").await,
            Err(CoordinationError::BadArguments(_))
        ));
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deleted);
        s.watch(
            "/d/child",
            Arc::new(move |event| {
                assert_eq!(event.kind, WatchEventKind::Deleted);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        s.delete("/d/child").await.unwrap();
        s.delete("/d").await.unwrap();
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert!(s.stat("/d").await.unwrap().is_none());
        assert!(matches!(
            s.delete("/d").await,
            Err(CoordinationError::NoNode(_))
        ));
        assert!(matches!(
            s.delete("/").await,
            Err(CoordinationError::BadArguments(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_is_not_counted() {
        let service = MemoryService::new();
        let servers = ServerSet::new(["memory"]).unwrap();
        service.connect_delay(Duration::from_secs(1));
        assert!(
            tokio::time::timeout(Duration::from_millis(10), service.connect(&servers))
                .await
                .is_err()
        );

        service.connect(&servers).await.unwrap();
        assert_eq!(service.max_concurrent_connects(), 1);
        assert_eq!(service.connects(), 1);
    }
}
