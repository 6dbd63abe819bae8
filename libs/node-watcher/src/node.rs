use std::{fmt, net::IpAddr, sync::Arc};

use serde::{Deserialize, Serialize};

/// Identity of a monitored node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    host: String,
    port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals bracketed, suitable for connecting.
    pub fn addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

impl From<&config::wire::Node> for Node {
    fn from(node: &config::wire::Node) -> Self {
        Self::new(node.host.clone(), node.port)
    }
}

/// Reachability of a node as observed by one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Available,
    Unavailable,
}

impl NodeState {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            NodeState::Available
        } else {
            NodeState::Unavailable
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Available => "available",
            NodeState::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives availability transitions from watchers.
///
/// Called from the watcher loop; implementations must return quickly and
/// never block on I/O.
pub trait NodeManager: Send + Sync + 'static {
    fn notify_state_change(&self, node: &Node, state: NodeState);
}

impl<T: NodeManager + ?Sized> NodeManager for Arc<T> {
    fn notify_state_change(&self, node: &Node, state: NodeState) {
        (**self).notify_state_change(node, state)
    }
}
