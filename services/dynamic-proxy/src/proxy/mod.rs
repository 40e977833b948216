//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - Per-port weighted group registry
//! - Weighted backend selection
//! - Generation-based draining of established connections
//! - TCP listener management and connection splicing
//! - Optional TLS termination and re-origination
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Selector(GroupRegistry) -> Backend
//!               |
//!               +-- waits on DrainController generation
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use dynamic_proxy::{Engine, Listener, ListenerConfig};
//!
//! let engine = Engine::new([26257]);
//! let config = ListenerConfig::new("127.0.0.1:26257".parse()?);
//! let listener = Arc::new(Listener::bind(config, engine.clone()).await?);
//! listener.run().await?;
//! ```

mod backend;
mod drain;
mod listener;
mod registry;
mod selector;
mod tls;

pub use backend::{
    host_of, server_name, BackendDialer, ConnectError, DEFAULT_CONNECT_TIMEOUT,
    MIN_CONNECT_TIMEOUT,
};
pub use drain::{DrainController, Generation};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, ListenerStatsSnapshot, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS,
};
pub use registry::{Group, GroupRegistry, GroupTable};
pub use selector::{select_server, SelectError};
pub use tls::{TlsConfigError, TlsSettings};
