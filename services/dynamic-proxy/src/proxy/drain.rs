//! Generation-based connection draining.
//!
//! Every port has a generation counter published through a watch channel.
//! A connection captures the generation that is live when its backend dial
//! succeeds and holds it for its whole lifetime. Advancing the port's
//! generation wakes every holder of an older one, which then tears its
//! connection down. Connections captured after the advance are unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

/// A captured generation of one port.
///
/// Closed once the port's generation moves past the captured id.
#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    rx: watch::Receiver<u64>,
}

impl Generation {
    /// The captured generation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the port has advanced past this generation.
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() != self.id
    }

    /// Wait until the port advances past this generation.
    ///
    /// Also returns if the controller is dropped, since nothing can keep the
    /// connection routed after that.
    pub async fn closed(&mut self) {
        let id = self.id;
        let _ = self.rx.wait_for(|current| *current != id).await;
    }
}

/// Owns the generation of every port.
///
/// The port map is swapped atomically, so capturing a token never waits on
/// another port being registered.
pub struct DrainController {
    generations: ArcSwap<HashMap<u16, Arc<watch::Sender<u64>>>>,
}

impl DrainController {
    /// Create a controller with no ports.
    pub fn new() -> Self {
        Self::with_ports(std::iter::empty())
    }

    /// Create a controller with a fresh generation for each port.
    pub fn with_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let generations: HashMap<u16, Arc<watch::Sender<u64>>> = ports
            .into_iter()
            .map(|port| (port, Arc::new(watch::Sender::new(0))))
            .collect();

        Self {
            generations: ArcSwap::from_pointee(generations),
        }
    }

    /// Register a port, creating its generation if missing.
    pub async fn register(&self, port: u16) {
        self.sender(port);
    }

    fn sender(&self, port: u16) -> Arc<watch::Sender<u64>> {
        if let Some(tx) = self.generations.load().get(&port) {
            return Arc::clone(tx);
        }

        let created = Arc::new(watch::Sender::new(0));
        let previous = self.generations.rcu(|generations| {
            let mut next = HashMap::clone(generations);
            next.entry(port).or_insert_with(|| Arc::clone(&created));
            next
        });

        match previous.get(&port) {
            Some(existing) => Arc::clone(existing),
            None => created,
        }
    }

    /// Capture the live generation of a port.
    pub async fn current_token(&self, port: u16) -> Generation {
        let mut rx = self.sender(port).subscribe();
        let id = *rx.borrow_and_update();
        Generation { id, rx }
    }

    /// Close the live generation of a port and open the next one.
    ///
    /// Returns the new generation id.
    pub async fn advance(&self, port: u16) -> u64 {
        let mut id = 0;
        self.sender(port).send_modify(|current| {
            *current += 1;
            id = *current;
        });

        info!(port = port, generation = id, "Generation advanced");
        id
    }

    /// The live generation id of a port, if the port is known.
    pub async fn generation(&self, port: u16) -> Option<u64> {
        self.generations
            .load()
            .get(&port)
            .map(|tx| *tx.borrow())
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}
