//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, diagnostics, and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /nodes
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::net::SocketAddr;

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};

use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{error, info, trace};

pub use crate::models::{Health, NodeStates, State};

/// Owns the task spawned by [`ExternalApi::serve`] and aborts it on drop.
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard dropped, stopping external api");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    nodes: NodeStates,
}

impl ExternalApi {
    /// Create a new ExternalApi instance serving the node states in `nodes`
    pub fn new(addr: SocketAddr, nodes: NodeStates) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            nodes,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            let prev = *guard;
            if prev != health {
                info!(from = %prev, to = %health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(addr: SocketAddr, state: State, nodes: NodeStates) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/nodes", routing::get(handlers::nodes))
            .layer(Extension(state))
            .layer(Extension(nodes));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let nodes = self.nodes.clone();
        let addr = self.addr;
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, nodes),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the api, stopping it when the returned [`ExternalApiGuard`] is
    /// dropped
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {
    use std::collections::BTreeMap;

    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use node_watcher::NodeState;
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;
    use vigil_core::metrics::{START_TIME, UPTIME};

    use crate::models::{Health, NodeStates, ServerResult, State};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    /// last reported state of every node, keyed by `host:port`
    pub(crate) async fn nodes(
        Extension(nodes): Extension<NodeStates>,
    ) -> ServerResult<impl IntoResponse> {
        let nodes = nodes
            .read()
            .iter()
            .map(|(node, state)| (node.to_string(), *state))
            .collect::<BTreeMap<String, NodeState>>();
        Ok(Json(nodes))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::response::IntoResponse;
    use node_watcher::{Node, NodeState};
    use parking_lot::{Mutex, RwLock};
    use serde::{Deserialize, Serialize};
    use std::{collections::HashMap, fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;

    /// Last state reported for each watched node
    pub type NodeStates = Arc<RwLock<HashMap<Node, NodeState>>>;

    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use node_watcher::{Node, NodeState};

    use super::*;

    fn api(addr: &str) -> (ExternalApi, NodeStates) {
        let nodes = NodeStates::default();
        (ExternalApi::new(addr.parse().unwrap(), nodes.clone()), nodes)
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let (api, _) = api("127.0.0.1:8889");
        let health = api.sender();
        let _handle = api.serve();
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        // initial health state will be BAD i.e. 500
        let r = reqwest::get("http://127.0.0.1:8889/health").await?;
        assert_eq!(r.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

        health.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        reqwest::get("http://127.0.0.1:8889/health")
            .await?
            .error_for_status()?;
        Ok(())
    }

    // very simple test for existence of metrics endpoint
    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        let (api, _) = api("127.0.0.1:8888");
        let _handle = api.serve();
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        let bytes = reqwest::get("http://127.0.0.1:8888/metrics")
            .await?
            .error_for_status()?
            .bytes()
            .await;
        assert!(bytes.is_ok());
        reqwest::get("http://127.0.0.1:8888/ping")
            .await?
            .error_for_status()?;

        Ok(())
    }

    #[tokio::test]
    async fn test_nodes() -> anyhow::Result<()> {
        let (api, nodes) = api("127.0.0.1:8887");
        let _handle = api.serve();
        nodes
            .write()
            .insert(Node::new("10.0.0.1", 6379), NodeState::Unavailable);
        nodes
            .write()
            .insert(Node::new("::1", 6380), NodeState::Available);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let body = reqwest::get("http://127.0.0.1:8887/nodes")
            .await?
            .error_for_status()?
            .json::<HashMap<String, String>>()
            .await?;
        assert_eq!(body.len(), 2);
        assert_eq!(body["10.0.0.1:6379"], "unavailable");
        assert_eq!(body["[::1]:6380"], "available");
        Ok(())
    }
}
