//! Routing engine shared by the proxy listeners and the control plane.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::error;

use crate::proxy::{select_server, DrainController, GroupRegistry, ListenerStats};

/// Shared routing engine.
///
/// Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: GroupRegistry,
    drains: DrainController,
    stats: ArcSwap<HashMap<u16, Arc<ListenerStats>>>,
}

impl Engine {
    /// Create an engine with an empty group table and a fresh generation
    /// for each port.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let ports: Vec<u16> = ports.into_iter().collect();
        let stats: HashMap<u16, Arc<ListenerStats>> = ports
            .iter()
            .map(|port| (*port, Arc::new(ListenerStats::default())))
            .collect();

        Self {
            inner: Arc::new(EngineInner {
                registry: GroupRegistry::with_ports(ports.iter().copied()),
                drains: DrainController::with_ports(ports.iter().copied()),
                stats: ArcSwap::from_pointee(stats),
            }),
        }
    }

    /// Group registry.
    pub fn registry(&self) -> &GroupRegistry {
        &self.inner.registry
    }

    /// Generation controller.
    pub fn drains(&self) -> &DrainController {
        &self.inner.drains
    }

    /// Register a listening port and return its statistics.
    pub async fn register(&self, port: u16) -> Arc<ListenerStats> {
        self.inner.registry.register(port).await;
        self.inner.drains.register(port).await;

        let created = Arc::new(ListenerStats::default());
        let previous = self.inner.stats.rcu(|stats| {
            let mut next = HashMap::clone(stats);
            next.entry(port).or_insert_with(|| Arc::clone(&created));
            next
        });
        previous.get(&port).cloned().unwrap_or(created)
    }

    /// Statistics of a registered port.
    pub async fn stats(&self, port: u16) -> Option<Arc<ListenerStats>> {
        self.inner.stats.load().get(&port).cloned()
    }

    /// Pick a backend for a new connection on `port`.
    ///
    /// `None` means no route: the port is unknown, drained, or the selector
    /// hit an invariant violation, which is logged with the table it saw.
    pub async fn select(&self, port: u16) -> Option<String> {
        let groups = self.inner.registry.groups(port).await?;

        let mut rng = rand::rng();
        match select_server(&groups, &mut rng) {
            Ok(server) => server.map(str::to_owned),
            Err(e) => {
                error!(port = port, groups = ?groups, error = %e, "Backend selection failed");
                None
            }
        }
    }

    /// Cut over to the named groups and drain the previous generation.
    ///
    /// Returns the new generation id.
    pub async fn activate(&self, port: u16, names: &[String], weights: &[f64]) -> u64 {
        self.inner
            .registry
            .set_active_groups(port, names, weights)
            .await;
        self.inner.drains.advance(port).await
    }
}
