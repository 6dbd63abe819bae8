#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};

mod manager;
mod membership;
mod startup_health;

use config::{Backend, VigilConfig};
use coordination::{
    Connector, MemoryService, NatsConnector, PathLayout, ReconnectPolicy, ServerSet,
    SessionClient,
};
use external_api::{ExternalApi, Health, NodeStates};
use manager::CoordinatedManager;
use membership::Registration;
use node_watcher::{Node, NodeManager, NodeWatcher};
use startup_health::verify_startup_subsystems;
use vigil_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    metrics,
    tokio::{self, runtime::Builder, signal, sync::mpsc, task::JoinHandle},
    tracing::*,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// placeholder address for the in-process backend
const MEMORY_SERVER: &str = "memory://local";
/// time queued reports get to persist on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.vigil_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start vigil"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    info!(vigil_id = ?config.vigil_id, "using id");

    debug!("parsing vigil config");
    let cfg = Arc::new(VigilConfig::parse(&config.config_path)?);
    let coord = cfg.coordination();
    info!(backend = ?coord.backend, servers = ?coord.servers, root = %coord.root, "coordination backend");

    match coord.backend {
        Backend::Nats => {
            let connector = NatsConnector::from_config(coord);
            run(config, Arc::clone(&cfg), connector, coord.servers.clone()).await
        }
        Backend::Memory => {
            warn!("memory backend selected, node reports are only visible to this process");
            let servers = if coord.servers.is_empty() {
                vec![MEMORY_SERVER.to_owned()]
            } else {
                coord.servers.clone()
            };
            run(config, Arc::clone(&cfg), MemoryService::new(), servers).await
        }
    }
}

async fn run<C: Connector>(
    config: cli::Config,
    cfg: Arc<VigilConfig>,
    connector: C,
    servers: Vec<String>,
) -> Result<()> {
    let coord = cfg.coordination();
    let layout = PathLayout::new(coord.root.clone())
        .with_context(|| format!("invalid coordination root {}", coord.root))?;
    let servers = ServerSet::new(servers)?;

    info!(%servers, "connecting to coordination service");
    let client = SessionClient::connect(connector, servers, ReconnectPolicy::from(coord))
        .await
        .context("failed to connect to coordination service")?;
    client
        .create_path(&layout.nodes())
        .await
        .context("failed to create nodes path")?;

    let states = NodeStates::default();
    let api = ExternalApi::new(config.external_api, states.clone());
    let api_sender = api.sender();
    let mut api_task = api.start();

    let token = CancellationToken::new();
    let mut membership_task = Registration::new(
        client.clone(),
        layout.clone(),
        config.vigil_id.clone(),
        cfg.nodes().len(),
    )
    .spawn(coord.membership_interval, token.clone());
    let monitor_task = spawn_coordination_monitor_task(
        client.clone(),
        api_sender.clone(),
        coord.membership_interval,
        token.clone(),
    );

    let (manager, reports) = CoordinatedManager::new(config.vigil_id.clone(), states);
    let mut reports_task = tokio::spawn(manager::persist_reports(
        client.clone(),
        layout.clone(),
        reports,
    ));
    let manager: Arc<dyn NodeManager> = Arc::new(manager);

    let probe = node_watcher::probe::from_config(cfg.probe());
    let watchers = cfg
        .nodes()
        .iter()
        .map(|node| {
            NodeWatcher::new(
                Node::from(node),
                Arc::clone(&probe),
                Arc::clone(&manager),
                cfg.poll_interval(),
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to create node watchers")?;
    // the watchers hold the only remaining handles, so the report queue
    // closes once they are gone
    drop(manager);
    for watcher in &watchers {
        watcher.watch();
    }
    info!(nodes = watchers.len(), interval = ?cfg.poll_interval(), "node watchers started");

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) =
        verify_startup_subsystems(&mut api_task, &mut membership_task, &mut reports_task).await
    {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        shutdown_watchers(&watchers).await;
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let signal_result = shutdown_signal(token.clone()).await;
    info!("shutting down");
    let _ = api_sender.send(Health::Bad).await;

    shutdown_watchers(&watchers).await;
    drop(watchers);
    match tokio::time::timeout(SHUTDOWN_GRACE, reports_task).await {
        Err(_) => warn!("pending node reports not persisted before shutdown"),
        Ok(Err(err)) => error!(?err, "error waiting for report persistence task"),
        Ok(Ok(())) => {}
    }
    if let Err(err) = membership_task.await {
        error!(?err, "error waiting for membership task");
    }
    if let Err(err) = monitor_task.await {
        error!(?err, "error waiting for coordination monitor task");
    }
    if let Err(err) = client.close().await {
        warn!(?err, "error closing coordination session");
    }
    api_task.abort();
    signal_result
}

async fn shutdown_watchers(watchers: &[NodeWatcher]) {
    futures::future::join_all(watchers.iter().map(|watcher| watcher.shutdown())).await;
}

/// Track coordination connectivity in the health endpoint.
fn spawn_coordination_monitor_task<C: Connector>(
    client: SessionClient<C>,
    health: mpsc::Sender<Health>,
    poll_interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        let mut was_connected = true;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("coordination monitor task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let is_connected = client.is_connected();
                    metrics::COORDINATION_CONNECTED.set(i64::from(is_connected));
                    if is_connected != was_connected {
                        was_connected = is_connected;
                        if is_connected {
                            info!("coordination session connected");
                            let _ = health.send(Health::Good).await;
                        } else {
                            warn!("coordination session not connected");
                            let _ = health.send(Health::Bad).await;
                        }
                    }
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
