use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::{Backend, ProbeKind};

/// watcher config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VigilConfig {
    inner: wire::Config,
    path: Option<PathBuf>,
}

impl VigilConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = Self::decode(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        debug!(?inner);

        Ok(Self {
            inner,
            path: Some(path.to_path_buf()),
        })
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let inner = Self::decode(s.as_ref())?;
        debug!(?inner);

        Ok(Self { inner, path: None })
    }

    fn decode(input: &str) -> Result<wire::Config> {
        let cfg: wire::Config = match serde_json::from_str(input) {
            Ok(cfg) => cfg,
            Err(_err) => serde_yaml::from_str(input).context("failed to decode config")?,
        };
        validate(&cfg)?;
        Ok(cfg)
    }

    pub fn coordination(&self) -> &wire::Coordination {
        &self.inner.coordination
    }
    pub fn nodes(&self) -> &[wire::Node] {
        &self.inner.nodes
    }
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }
    pub fn probe(&self) -> &wire::Probe {
        &self.inner.probe
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn validate(cfg: &wire::Config) -> Result<()> {
    let coordination = &cfg.coordination;
    if coordination.backend == Backend::Nats && coordination.servers.is_empty() {
        bail!("nats coordination backend requires at least one server");
    }
    if !coordination.root.starts_with('/') {
        bail!(
            "coordination root must be an absolute path, got {:?}",
            coordination.root
        );
    }
    if coordination.membership_interval.is_zero() {
        bail!("coordination membership_interval must be greater than zero");
    }
    if cfg.poll_interval.is_zero() {
        bail!("poll_interval must be greater than zero");
    }
    if let Some(node) = cfg.nodes.iter().find(|node| node.host.trim().is_empty()) {
        bail!("node with port {} has an empty host", node.port);
    }
    Ok(())
}
