use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// default coordination root path
pub const DEFAULT_ROOT: &str = "/vigil";
/// default JetStream KV bucket backing the nats coordination backend
pub const DEFAULT_BUCKET: &str = "vigil";
/// default number of session rebuilds an operation may trigger
pub const DEFAULT_MAX_RECONNECTS: u32 = 3;

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub coordination: Coordination,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(default)]
    pub probe: Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Coordination {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    #[serde(
        default = "default_reconnect_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub reconnect_backoff: Duration,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(
        default = "default_membership_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub membership_interval: Duration,
}

/// which coordination service implementation to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// NATS JetStream KV
    #[default]
    Nats,
    /// in-process store, state is lost on exit
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Probe {
    #[serde(default)]
    pub kind: ProbeKind,
    #[serde(
        default = "default_probe_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            kind: ProbeKind::default(),
            timeout: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// redis `PING`, expects `+PONG`
    #[default]
    RedisPing,
    /// plain TCP connect
    Tcp,
}

pub const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

pub const fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_membership_interval() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_probe_timeout() -> Duration {
    Duration::from_millis(500)
}

pub const fn default_max_reconnects() -> u32 {
    DEFAULT_MAX_RECONNECTS
}

pub fn default_root() -> String {
    DEFAULT_ROOT.to_owned()
}

pub fn default_bucket() -> String {
    DEFAULT_BUCKET.to_owned()
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "500ms", "60m", "24h"
/// If no unit is specified, assumes seconds
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match WireDuration::deserialize(de)? {
        WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        WireDuration::String(s) => parse_duration(&s).map_err(de::Error::custom),
    }
}
