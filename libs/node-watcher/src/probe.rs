//! Reachability checks run by a watcher on every tick.

use std::{fmt, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time,
};
use tracing::trace;

use crate::node::Node;

/// `PING` as a RESP array.
const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";
const PONG: &str = "+PONG";

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// A reachability check against one node. Any error means unreachable.
#[async_trait]
pub trait Probe: Send + Sync + fmt::Debug + 'static {
    async fn probe(&self, node: &Node) -> ProbeResult<()>;
}

/// Build the probe described by the config file.
pub fn from_config(cfg: &config::wire::Probe) -> Arc<dyn Probe> {
    match cfg.kind {
        config::ProbeKind::Tcp => Arc::new(TcpProbe::new(cfg.timeout)),
        config::ProbeKind::RedisPing => Arc::new(RedisPing::new(cfg.timeout)),
    }
}

async fn within<T, F>(timeout: Duration, fut: F) -> ProbeResult<T>
where
    F: Future<Output = ProbeResult<T>>,
{
    time::timeout(timeout, fut)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

/// Succeeds if a TCP connection can be established.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, node: &Node) -> ProbeResult<()> {
        within(self.timeout, async {
            TcpStream::connect(node.addr()).await?;
            Ok(())
        })
        .await
    }
}

/// Sends a redis `PING` and expects `+PONG`.
#[derive(Debug, Clone, Copy)]
pub struct RedisPing {
    timeout: Duration,
}

impl RedisPing {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for RedisPing {
    async fn probe(&self, node: &Node) -> ProbeResult<()> {
        within(self.timeout, async {
            let mut stream = BufReader::new(TcpStream::connect(node.addr()).await?);
            stream.get_mut().write_all(PING).await?;

            let mut line = String::new();
            if stream.read_line(&mut line).await? == 0 {
                return Err(ProbeError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            let reply = line.trim_end();
            trace!(%node, reply, "redis ping reply");
            if reply == PONG {
                Ok(())
            } else {
                Err(ProbeError::UnexpectedReply(reply.to_owned()))
            }
        })
        .await
    }
}
