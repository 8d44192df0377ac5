//! Fan-out relay
//!
//! Every participant in a sync session is a [`Node`]: the local clipboard and
//! one node per connected peer. A message produced by one attached node is
//! delivered concurrently to every other attached node. Each node is wrapped
//! in [`echo::EchoSuppressed`] on attach so that a payload a node already holds
//! is never handed back to it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::transport::{Fingerprint, Message, TransportError};

pub mod echo;
pub mod local;

pub use echo::EchoSuppressed;
pub use local::LocalNode;

/// A reassembly of `fingerprint` has started on some node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub fingerprint: Fingerprint,
    pub total: usize,
}

/// Receives what a node produces
pub trait NodeHandler: Send + Sync {
    /// The node produced a complete message
    fn on_message(&self, message: Message);

    /// The node started receiving a message
    fn on_incoming(&self, announcement: Announcement);
}

/// Endpoint attached to a [`Relay`]
#[async_trait]
pub trait Node: Send + Sync {
    /// Begin producing events. Called once, by the relay, on attach.
    async fn start(&self, handler: Arc<dyn NodeHandler>) -> crate::Result<()>;

    /// Apply a message produced by another node
    async fn accept(&self, message: Message) -> crate::Result<()>;

    /// Another node started receiving a message that will follow
    async fn prepare(&self, _announcement: &Announcement) -> crate::Result<()> {
        Ok(())
    }

    /// Human-readable name for logs
    fn describe(&self) -> String;
}

#[derive(Debug)]
enum NodeEvent {
    Message(Message),
    Incoming(Announcement),
}

/// Handler given to a node by the relay; queues events for its forwarder
struct Forwarding {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandler for Forwarding {
    fn on_message(&self, message: Message) {
        // Closed once the node is detached
        let _ = self.tx.send(NodeEvent::Message(message));
    }

    fn on_incoming(&self, announcement: Announcement) {
        let _ = self.tx.send(NodeEvent::Incoming(announcement));
    }
}

type Target = (String, Arc<dyn Node>);

struct Attached {
    key: usize,
    node: Arc<dyn Node>,
    // Dropping the sender stops the forwarder
    _stop: oneshot::Sender<()>,
    forwarder: JoinHandle<()>,
}

/// Identity of an attached node: the address of its shared allocation
fn node_key<N: Node + ?Sized>(node: &Arc<N>) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

/// Set of attached nodes with fan-out between them
#[derive(Default)]
pub struct Relay {
    nodes: Mutex<Vec<Attached>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Attached>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach `node` until the returned guard is dropped.
    ///
    /// Fails if this node instance is already attached, or if it fails to
    /// start; a node that fails to start is left detached.
    pub async fn attach(self: &Arc<Self>, node: Arc<dyn Node>) -> crate::Result<NodeGuard> {
        let key = node_key(&node);
        let wrapped: Arc<dyn Node> = Arc::new(EchoSuppressed::new(node));
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut nodes = self.lock();
            if nodes.iter().any(|a| a.key == key) {
                return Err(TransportError::AlreadyAttached.into());
            }

            let (stop, stopped) = oneshot::channel();
            let forwarder = tokio::spawn(forward(Arc::downgrade(self), key, rx, stopped));
            nodes.push(Attached {
                key,
                node: Arc::clone(&wrapped),
                _stop: stop,
                forwarder,
            });
        }

        let guard = NodeGuard {
            relay: Arc::downgrade(self),
            key,
        };

        if let Err(e) = wrapped.start(Arc::new(Forwarding { tx })).await {
            warn!("Node {} failed to start: {}", wrapped.describe(), e);
            guard.detach();
            return Err(e);
        }

        info!("Attached {}", wrapped.describe());
        Ok(guard)
    }

    /// Detach `node`; returns `false` if it was not attached
    pub fn detach<N: Node + ?Sized>(&self, node: &Arc<N>) -> bool {
        self.detach_key(node_key(node))
    }

    fn detach_key(&self, key: usize) -> bool {
        let removed = {
            let mut nodes = self.lock();
            nodes
                .iter()
                .position(|a| a.key == key)
                .map(|index| nodes.remove(index))
        };

        match removed {
            Some(attached) => {
                info!("Detached {}", attached.node.describe());
                true
            }
            None => false,
        }
    }

    pub fn is_attached<N: Node + ?Sized>(&self, node: &Arc<N>) -> bool {
        let key = node_key(node);
        self.lock().iter().any(|a| a.key == key)
    }

    /// Number of attached nodes
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every attached node except the one with key `sender`
    fn others(&self, sender: usize) -> Vec<Target> {
        self.lock()
            .iter()
            .filter(|a| a.key != sender)
            .map(|a| (a.node.describe(), Arc::clone(&a.node)))
            .collect()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        let nodes = match self.nodes.get_mut() {
            Ok(nodes) => nodes,
            Err(poisoned) => poisoned.into_inner(),
        };
        for attached in nodes.drain(..) {
            attached.forwarder.abort();
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.lock().iter().map(|a| a.node.describe()).collect();
        f.debug_struct("Relay").field("nodes", &names).finish()
    }
}

/// Pumps one node's events into the relay
async fn forward(
    relay: Weak<Relay>,
    sender: usize,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut deliveries = JoinSet::new();

    loop {
        let event = tokio::select! {
            _ = &mut stopped => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            Some(_) = deliveries.join_next(), if !deliveries.is_empty() => continue,
        };

        let Some(strong) = relay.upgrade() else {
            break;
        };
        let targets = strong.others(sender);
        drop(strong);

        match event {
            NodeEvent::Message(message) => {
                debug!(
                    "Relaying {} to {} node(s)",
                    message.fingerprint().short(),
                    targets.len()
                );
                deliveries.spawn(deliver(targets, message));
            }
            // Awaited here so a prepare never overtakes the message it announces
            NodeEvent::Incoming(announcement) => announce(targets, announcement).await,
        }
    }

    while deliveries.join_next().await.is_some() {}
}

async fn deliver(targets: Vec<Target>, message: Message) {
    let results = join_all(targets.iter().map(|(_, node)| node.accept(message.clone()))).await;

    for ((name, _), result) in targets.iter().zip(results) {
        if let Err(e) = result {
            warn!(
                "Failed to deliver {} to {}: {}",
                message.fingerprint().short(),
                name,
                e
            );
        }
    }
}

async fn announce(targets: Vec<Target>, announcement: Announcement) {
    let results = join_all(targets.iter().map(|(_, node)| node.prepare(&announcement))).await;

    for ((name, _), result) in targets.iter().zip(results) {
        if let Err(e) = result {
            warn!("Failed to prepare {} for incoming message: {}", name, e);
        }
    }
}

/// Keeps a node attached to a relay; detaches on drop
#[must_use = "the node is detached as soon as the guard is dropped"]
pub struct NodeGuard {
    relay: Weak<Relay>,
    key: usize,
}

impl NodeGuard {
    /// Detach now
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.detach_key(self.key);
        }
    }
}

impl std::fmt::Debug for NodeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGuard").field("key", &self.key).finish()
    }
}
