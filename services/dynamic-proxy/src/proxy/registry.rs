//! Per-port group registry.
//!
//! Each listening port owns a table mapping group name to a weighted list of
//! backend addresses. The registry is the single source of truth for routing:
//! the control plane mutates it and the selector reads it on every accept.
//!
//! - Tables are partitioned by port; ports never contend with each other
//! - Writers on one port are serialized through a read-copy-update swap
//! - Readers get an immutable snapshot and never see a partial mutation
//! - A zero-weight group keeps its servers so it can be re-activated later

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A named, weighted set of backend addresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Relative share of new connections. Zero means inactive.
    pub weight: f64,
    /// Backend addresses (`host:port`), in insertion order, duplicates kept.
    pub servers: Vec<String>,
}

impl Group {
    /// Create a group.
    pub fn new(weight: f64, servers: Vec<String>) -> Self {
        Self { weight, servers }
    }

    /// A group takes traffic only with a positive weight and at least one server.
    pub fn is_active(&self) -> bool {
        self.weight > 0.0 && !self.servers.is_empty()
    }
}

/// Groups of one port keyed by name.
pub type GroupTable = BTreeMap<String, Group>;

/// Routing state of a single port.
///
/// Uses ArcSwap so the accept path loads a snapshot without locking.
#[derive(Debug, Default)]
struct PortRoutes {
    snapshot: ArcSwap<GroupTable>,
}

impl PortRoutes {
    fn load(&self) -> Arc<GroupTable> {
        self.snapshot.load_full()
    }

    /// Apply `mutate` to a copy of the current table and swap it in.
    ///
    /// `mutate` may run more than once if another writer raced us, so it must
    /// only touch the table it is handed.
    fn update<F>(&self, mut mutate: F)
    where
        F: FnMut(&mut GroupTable),
    {
        self.snapshot.rcu(|current| {
            let mut next = GroupTable::clone(current);
            mutate(&mut next);
            next
        });
    }
}

/// Registry of group tables for every known port.
///
/// The port map itself is swapped atomically as well, so the accept path of
/// one port never waits on a port being created elsewhere.
pub struct GroupRegistry {
    ports: ArcSwap<HashMap<u16, Arc<PortRoutes>>>,
}

impl GroupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_ports(std::iter::empty())
    }

    /// Create a registry with an empty table for each port.
    pub fn with_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let ports: HashMap<u16, Arc<PortRoutes>> = ports
            .into_iter()
            .map(|port| (port, Arc::new(PortRoutes::default())))
            .collect();

        Self {
            ports: ArcSwap::from_pointee(ports),
        }
    }

    /// Register a port, creating its empty table if missing.
    pub async fn register(&self, port: u16) {
        self.get_or_create(port);
    }

    fn get(&self, port: u16) -> Option<Arc<PortRoutes>> {
        self.ports.load().get(&port).cloned()
    }

    fn get_or_create(&self, port: u16) -> Arc<PortRoutes> {
        if let Some(routes) = self.get(port) {
            return routes;
        }

        let created = Arc::new(PortRoutes::default());
        let previous = self.ports.rcu(|ports| {
            let mut next = HashMap::clone(ports);
            next.entry(port).or_insert_with(|| Arc::clone(&created));
            next
        });

        // Another writer may have created the table first.
        match previous.get(&port) {
            Some(existing) => Arc::clone(existing),
            None => {
                debug!(port = port, "Created group table");
                created
            }
        }
    }

    /// Insert or update a group.
    ///
    /// Servers are always replaced. The weight is only replaced when the new
    /// weight is positive, so a zero weight on update leaves it unchanged. A
    /// new group takes the supplied weight as is, zero included.
    pub async fn set_group_servers(&self, port: u16, name: &str, servers: Vec<String>, weight: f64) {
        let routes = self.get_or_create(port);

        routes.update(|table| match table.get_mut(name) {
            Some(group) => {
                group.servers = servers.clone();
                if weight > 0.0 {
                    group.weight = weight;
                }
            }
            None => {
                table.insert(name.to_string(), Group::new(weight, servers.clone()));
            }
        });

        info!(
            port = port,
            group = %name,
            servers = ?servers,
            weight = weight,
            "Group set"
        );
    }

    /// Remove a group. Unknown ports and groups are ignored.
    pub async fn delete_group(&self, port: u16, name: &str) {
        let Some(routes) = self.get(port) else {
            return;
        };

        routes.update(|table| {
            table.remove(name);
        });

        info!(port = port, group = %name, "Group deleted");
    }

    /// Cut traffic over to the named groups.
    ///
    /// Every group on the port is zeroed first, then each named group that
    /// exists gets `weights[i]` if that weight is positive. Names without a
    /// weight count as zero and unknown names are skipped, so an empty list
    /// drains the port.
    pub async fn set_active_groups(&self, port: u16, names: &[String], weights: &[f64]) {
        let routes = self.get_or_create(port);
        let mut activated = Vec::new();

        routes.update(|table| {
            activated.clear();

            for group in table.values_mut() {
                group.weight = 0.0;
            }

            for (i, name) in names.iter().enumerate() {
                let weight = weights.get(i).copied().unwrap_or(0.0);
                if let Some(group) = table.get_mut(name) {
                    if weight > 0.0 {
                        group.weight = weight;
                    }
                    activated.push((name.clone(), group.weight));
                }
            }
        });

        for (group, weight) in &activated {
            info!(port = port, group = %group, weight = *weight, "Group activated");
        }

        if activated.is_empty() {
            info!(port = port, "Drained");
        }
    }

    /// Snapshot of one port's groups, or `None` for an unknown port.
    pub async fn groups(&self, port: u16) -> Option<Arc<GroupTable>> {
        self.get(port).map(|routes| routes.load())
    }

    /// Snapshot of every port's groups.
    pub async fn snapshot(&self) -> BTreeMap<u16, Arc<GroupTable>> {
        self.ports
            .load()
            .iter()
            .map(|(port, routes)| (*port, routes.load()))
            .collect()
    }

    /// All ports with a table.
    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.load().keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}
