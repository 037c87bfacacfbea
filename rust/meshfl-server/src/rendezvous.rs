//! The rendezvous logic.
//!
//! The rendezvous server introduces the nodes of a task to each other. It
//!
//! - assigns every connecting node a fresh id.
//! - collects the nodes of a task that are ready for a round and, once enough of
//!   them are, tells each of them who the others are.
//! - relays the signals that establish the peer connections.
//!
//! The server never sees any aggregation payload.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meshfl_core::{
    message::{ClientMessage, ServerMessage, Signal},
    NodeId,
};

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to the rendezvous protocol.
pub enum RendezvousError {
    #[error("the client connected twice")]
    AlreadyConnected,
    #[error("the client sent a message before connecting")]
    NotConnected,
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

struct Client {
    task: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// The state of the rendezvous server.
pub struct Rendezvous {
    minimum_ready_peers: usize,
    clients: HashMap<NodeId, Client>,
    ready: HashMap<String, BTreeSet<NodeId>>,
}

impl Rendezvous {
    /// Creates a rendezvous grouping nodes into rounds of at least
    /// `minimum_ready_peers` nodes.
    pub fn new(minimum_ready_peers: usize) -> Self {
        Self {
            minimum_ready_peers: minimum_ready_peers.max(1),
            clients: HashMap::new(),
            ready: HashMap::new(),
        }
    }

    /// Gets the number of connected nodes.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Gets the nodes of `task` waiting for a round.
    pub fn ready(&self, task: &str) -> Option<&BTreeSet<NodeId>> {
        self.ready.get(task)
    }

    /// Registers a node of `task` and sends it its id.
    pub fn register(&mut self, task: &str, tx: mpsc::UnboundedSender<ServerMessage>) -> NodeId {
        let id = NodeId::from(Uuid::new_v4().to_string());
        let _ = tx.send(ServerMessage::AssignNodeId { id: id.clone() });
        self.clients.insert(
            id.clone(),
            Client {
                task: task.to_string(),
                tx,
            },
        );
        info!("node {} joined task {}", id, task);
        id
    }

    /// Marks a node as ready. Once enough nodes of its task are ready, sends each
    /// of them the others and starts collecting anew.
    ///
    /// # Errors
    /// Fails if the node is unknown.
    pub fn ready_for_round(&mut self, id: &NodeId) -> Result<(), RendezvousError> {
        let task = self
            .clients
            .get(id)
            .map(|client| client.task.clone())
            .ok_or_else(|| RendezvousError::UnknownNode(id.clone()))?;
        let ready = self.ready.entry(task.clone()).or_default();
        ready.insert(id.clone());
        debug!(
            "node {} is ready ({}/{} in task {})",
            id,
            ready.len(),
            self.minimum_ready_peers,
            task
        );
        if ready.len() < self.minimum_ready_peers {
            return Ok(());
        }

        let nodes = std::mem::take(ready);
        info!("starting a round of task {} with {} nodes", task, nodes.len());
        for node in nodes.iter() {
            let peers = nodes.iter().filter(|peer| *peer != node).cloned().collect();
            if let Some(client) = self.clients.get(node) {
                let _ = client.tx.send(ServerMessage::PeersForRound { peers });
            }
        }
        Ok(())
    }

    /// Relays a signal from the node `from` to the node `to`.
    ///
    /// # Errors
    /// Fails if the recipient is unknown.
    pub fn signal(&self, from: &NodeId, to: &NodeId, signal: Signal) -> Result<(), RendezvousError> {
        let client = self
            .clients
            .get(to)
            .ok_or_else(|| RendezvousError::UnknownNode(to.clone()))?;
        let _ = client.tx.send(ServerMessage::SignalForPeer {
            peer: from.clone(),
            signal,
        });
        Ok(())
    }

    /// Forgets a node.
    pub fn unregister(&mut self, id: &NodeId) {
        if let Some(client) = self.clients.remove(id) {
            if let Some(ready) = self.ready.get_mut(&client.task) {
                ready.remove(id);
            }
            info!("node {} left task {}", id, client.task);
        }
    }
}

#[derive(Clone)]
/// A shareable handle to a [`Rendezvous`].
pub struct RendezvousHandle(Arc<Mutex<Rendezvous>>);

impl RendezvousHandle {
    pub fn new(minimum_ready_peers: usize) -> Self {
        Self(Arc::new(Mutex::new(Rendezvous::new(minimum_ready_peers))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Rendezvous> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves one connection of a node of `task` until either side closes it.
    ///
    /// # Errors
    /// Fails if the node violates the protocol. The node is forgotten either way.
    pub async fn serve(
        self,
        task: String,
        mut rx: mpsc::UnboundedReceiver<ClientMessage>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(), RendezvousError> {
        let mut id = None;
        let result = loop {
            let message = match rx.recv().await {
                Some(message) => message,
                None => break Ok(()),
            };
            if let Err(err) = self.handle(&task, &mut id, &tx, message) {
                break Err(err);
            }
        };
        if let Some(id) = id {
            self.lock().unregister(&id);
        }
        if let Err(ref err) = result {
            warn!("closing rendezvous connection: {}", err);
        }
        result
    }

    fn handle(
        &self,
        task: &str,
        id: &mut Option<NodeId>,
        tx: &mpsc::UnboundedSender<ServerMessage>,
        message: ClientMessage,
    ) -> Result<(), RendezvousError> {
        let mut rendezvous = self.lock();
        match (message, id.clone()) {
            (ClientMessage::ClientConnected, None) => {
                *id = Some(rendezvous.register(task, tx.clone()));
                Ok(())
            }
            (ClientMessage::ClientConnected, Some(_)) => Err(RendezvousError::AlreadyConnected),
            (_, None) => Err(RendezvousError::NotConnected),
            (ClientMessage::PeerIsReady, Some(id)) => rendezvous.ready_for_round(&id),
            (ClientMessage::SignalForPeer { peer, signal }, Some(id)) => {
                if let Err(err) = rendezvous.signal(&id, &peer, signal) {
                    // the recipient may have left in the meantime
                    debug!("dropping signal from node {}: {}", id, err);
                }
                Ok(())
            }
        }
    }

    /// Connects an in-process node to `task`.
    ///
    /// Returns the node's ends of the connection, which stays open until the node
    /// drops its sender.
    pub fn connect_local(
        &self,
        task: &str,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().serve(task.to_string(), client_rx, server_tx));
        (client_tx, server_rx)
    }
}
