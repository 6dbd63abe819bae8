//! # coordination
//!
//! Resilient access to a hierarchical coordination service.
//!
//! - [`Session`] and [`Connector`] describe one live session and how to open
//!   one. Two backends are provided: [`NatsConnector`] over a JetStream KV
//!   bucket and [`MemoryService`], an in-process service with fault
//!   injection.
//! - [`SessionClient`] owns the current session and rebuilds it when the
//!   service expires it, either during a call (retried within a per-call
//!   budget) or on its own (via the expiry callback).
//! - [`PathLayout`] maps node reports and watcher registrations to paths.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod client;
pub mod error;
pub mod memory;
pub mod nats;
pub mod paths;
pub mod session;

pub use client::{ReconnectPolicy, SessionClient};
pub use error::{CoordinationError, CoordinationResult};
pub use memory::{MemoryService, MemorySession};
pub use nats::{NatsConnector, NatsSession};
pub use paths::PathLayout;
pub use session::{
    Connector, CreateMode, ServerSet, Session, Stat, WatchCallback, WatchEvent, WatchEventKind,
};
