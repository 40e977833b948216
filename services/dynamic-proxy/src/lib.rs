pub mod api;
pub mod config;
mod engine;
pub mod proxy;

pub use engine::Engine;
pub use proxy::{
    DrainController, Generation, Group, GroupRegistry, GroupTable, Listener, ListenerConfig,
    ListenerStats, ListenerStatsSnapshot, SelectError, TlsSettings,
};
