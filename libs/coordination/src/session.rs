//! The boundary between [`SessionClient`](crate::SessionClient) and a
//! concrete coordination service.
//!
//! A [`Connector`] opens sessions against a [`ServerSet`]; a [`Session`] is
//! one live handle. Sessions are never repaired in place: once a session
//! reports [`CoordinationError::SessionExpired`] it is discarded and a new one
//! is opened.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::error::{CoordinationError, CoordinationResult};

/// Called once when a watched path changes.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Called by a session when the service expires it.
pub type ExpiryCallback = Box<dyn Fn() + Send + Sync>;

/// Immutable list of coordination service addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSet(Arc<[String]>);

impl ServerSet {
    /// Build a server set. At least one address is required.
    pub fn new<I, S>(servers: I) -> CoordinationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers = servers.into_iter().map(Into::into).collect::<Vec<_>>();
        if servers.is_empty() {
            return Err(CoordinationError::BadArguments(
                "server set must contain at least one address".into(),
            ));
        }
        Ok(Self(servers.into()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// increases on every write (a per-node counter in memory, the KV
    /// revision on nats)
    pub version: u64,
    pub data_length: usize,
    /// id of the session owning an ephemeral node
    pub ephemeral_owner: Option<u64>,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Lives until explicitly removed.
    Persistent,
    /// Removed when the creating session closes or expires.
    Ephemeral,
    /// Persistent, with a monotonically increasing suffix appended to the name.
    PersistentSequential,
    /// Ephemeral, with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    Deleted,
    DataChanged,
}

/// Delivered to a [`WatchCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// One live session with the coordination service.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug + 'static {
    /// Identifies the session; reported as [`Stat::ephemeral_owner`] for the
    /// ephemeral nodes it owns.
    fn id(&self) -> u64;

    /// Read a node's data and metadata.
    async fn get(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)>;

    /// Replace the data of an existing node.
    async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat>;

    /// Create a node, returning the path actually created (which differs from
    /// `path` for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode)
    -> CoordinationResult<String>;

    /// Remove a node. Fails with `NoNode` if it is missing and with
    /// `BadArguments` if it has children.
    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Metadata of a node, `None` if it does not exist.
    async fn stat(&self, path: &str) -> CoordinationResult<Option<Stat>>;

    /// Register a one-shot watch on `path`.
    async fn watch(&self, path: &str, callback: WatchCallback) -> CoordinationResult<()>;

    /// Whether the session currently reports a connected state.
    fn is_connected(&self) -> bool;

    /// Register a callback fired when the service expires this session.
    fn on_expired(&self, callback: ExpiryCallback) -> CoordinationResult<()>;

    /// Close the session. Ephemeral nodes it owns go away.
    async fn close(&self) -> CoordinationResult<()>;
}

/// Opens new sessions.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    type Session: Session;

    async fn connect(&self, servers: &ServerSet) -> CoordinationResult<Self::Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_set() {
        let servers = ServerSet::new(["zk1:2181", "zk2:2181"]).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers.to_string(), "zk1:2181,zk2:2181");
        assert!(matches!(
            ServerSet::new(Vec::<String>::new()),
            Err(CoordinationError::BadArguments(_))
        ));
    }

    #[test]
    fn test_create_mode() {
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
    }
}
