//! The connections of a node to its peers.
//!
//! A [`PeerPool`] owns one [`PeerConnection`] per remote node. Connections are
//! created on demand, when a round requires a peer the pool isn't connected to yet,
//! and reused by later rounds.
//!
//! Of two nodes, the one with the smaller id initiates the connection. Signals from
//! a node the pool doesn't know yet are kept until the pool creates the matching
//! connection, or until a round that doesn't include that node starts.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    peer::{Peer, PeerError, PeerEvent, PeerState},
    signaling::RendezvousSender,
    transport::Transport,
};
use meshfl_core::{
    message::{ClientMessage, EncodeError, FromBytes, PeerMessage, Signal, ToBytes},
    NodeId,
};

/// The maximal number of signals kept for nodes the pool has no connection to.
const MAX_DEFERRED_SIGNALS: usize = 256;

#[derive(Debug, Error)]
/// Errors related to the peer pool.
pub enum PoolError {
    #[error("the peers to connect to include the own node id")]
    SelfConnection,
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
    #[error("connection to peer {0} failed: {1}")]
    Connection(NodeId, #[source] PeerError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Clone)]
/// A connection to a peer, along with the relay of its signals.
pub struct PeerConnection {
    peer: Peer,
    messages: Arc<Mutex<Option<mpsc::UnboundedReceiver<PeerMessage>>>>,
}

impl PeerConnection {
    /// Wraps `peer` and relays its signals through `rendezvous`.
    fn new(
        peer: Peer,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        rendezvous: RendezvousSender,
    ) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let id = peer.id().clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::Signal(signal) => {
                        let message = ClientMessage::SignalForPeer {
                            peer: id.clone(),
                            signal,
                        };
                        if let Err(err) = rendezvous.send(message) {
                            warn!("failed to relay signal to peer {}: {}", id, err);
                        }
                    }
                    PeerEvent::Connect => debug!("peer {} connected", id),
                    PeerEvent::Data(data) => match PeerMessage::from_byte_slice(&data) {
                        Ok(message) => {
                            let _ = messages_tx.send(message);
                        }
                        Err(err) => warn!("invalid message from peer {}: {:#}", id, err),
                    },
                    PeerEvent::Close => break,
                }
            }
            debug!("peer {} disconnected", id);
        });
        Self {
            peer,
            messages: Arc::new(Mutex::new(Some(messages_rx))),
        }
    }

    /// Gets the id of the remote node.
    pub fn id(&self) -> &NodeId {
        self.peer.id()
    }

    pub fn state(&self) -> PeerState {
        self.peer.state()
    }

    /// Checks whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &PeerConnection) -> bool {
        self.peer.ptr_eq(&other.peer)
    }

    /// Waits until the connection is established.
    pub async fn connect(&self) -> Result<(), PoolError> {
        self.peer
            .connected()
            .await
            .map_err(|err| PoolError::Connection(self.id().clone(), err))
    }

    /// Handles a signal from the remote node.
    pub async fn signal(&self, signal: Signal) -> Result<(), PoolError> {
        self.peer
            .signal(signal)
            .await
            .map_err(|err| PoolError::Connection(self.id().clone(), err))
    }

    /// Sends a message to the remote node.
    pub fn send(&self, message: &PeerMessage) -> Result<(), PoolError> {
        self.peer
            .send(&message.to_bytes()?)
            .map_err(|err| PoolError::Connection(self.id().clone(), err))
    }

    /// Takes the stream of messages from the remote node.
    ///
    /// The stream can only be taken once and ends when the connection closes.
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<PeerMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn close(&self) {
        self.peer.close();
    }
}

#[derive(Default)]
struct PoolState {
    peers: HashMap<NodeId, PeerConnection>,
    deferred: HashMap<NodeId, Vec<Signal>>,
}

struct PoolInner {
    id: NodeId,
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
/// The connections of a node to its peers.
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

impl PeerPool {
    /// Creates an empty pool for the node `id`.
    pub fn new(id: NodeId, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                id,
                transport,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the id of the node owning the pool.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn len(&self) -> usize {
        self.state().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().peers.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state().peers.contains_key(id)
    }

    /// Gets the connections to `targets`, creating the missing ones.
    ///
    /// New connections are registered before they are established, so that the
    /// signals of the remote nodes reach them. `on_new` is invoked for every new
    /// connection right after its registration. Existing connections are reused.
    /// Signals kept for nodes outside of `targets` are dropped.
    ///
    /// # Errors
    /// Fails if `targets` contains the own id or if a new connection fails.
    pub async fn get_peers<F>(
        &self,
        targets: &BTreeSet<NodeId>,
        rendezvous: &RendezvousSender,
        mut on_new: F,
    ) -> Result<HashMap<NodeId, PeerConnection>, PoolError>
    where
        F: FnMut(&PeerConnection) + Send,
    {
        if targets.contains(&self.inner.id) {
            return Err(PoolError::SelfConnection);
        }
        let missing: Vec<NodeId> = {
            let mut state = self.state();
            state.deferred.retain(|id, signals| {
                let keep = targets.contains(id);
                if !keep {
                    debug!("dropping {} signals from peer {}", signals.len(), id);
                }
                keep
            });
            targets
                .iter()
                .filter(|id| !state.peers.contains_key(*id))
                .cloned()
                .collect()
        };

        let mut created = Vec::with_capacity(missing.len());
        for id in missing {
            let initiator = self.inner.id < id;
            let (peer, events) = Peer::new(id.clone(), initiator, self.inner.transport.as_ref())
                .await
                .map_err(|err| PoolError::Connection(id.clone(), err))?;
            let connection = PeerConnection::new(peer, events, rendezvous.clone());

            let deferred = {
                let mut state = self.state();
                if state.peers.contains_key(&id) {
                    connection.close();
                    continue;
                }
                state.peers.insert(id.clone(), connection.clone());
                state.deferred.remove(&id).unwrap_or_default()
            };
            debug!(
                "registered connection to peer {} (initiator: {})",
                id, initiator
            );
            on_new(&connection);
            for signal in deferred {
                if let Err(err) = connection.signal(signal).await {
                    warn!("failed to apply deferred signal: {}", err);
                }
            }
            created.push(connection);
        }

        if !created.is_empty() {
            try_join_all(created.iter().map(PeerConnection::connect)).await?;
            info!("connected to {} new peers", created.len());
        }

        let state = self.state();
        Ok(targets
            .iter()
            .filter_map(|id| state.peers.get(id).map(|c| (id.clone(), c.clone())))
            .collect())
    }

    /// Routes a signal to the connection to `peer`.
    ///
    /// # Errors
    /// Fails if the pool has no connection to `peer` or if the signal is invalid.
    pub async fn signal(&self, peer: &NodeId, signal: Signal) -> Result<(), PoolError> {
        let connection = self
            .state()
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPeer(peer.clone()))?;
        connection.signal(signal).await
    }

    /// Routes a signal to the connection to `peer`, or keeps it until the pool
    /// creates that connection.
    ///
    /// # Errors
    /// Fails if the signal is invalid.
    pub async fn route_signal(&self, peer: &NodeId, signal: Signal) -> Result<(), PoolError> {
        let connection = {
            let mut state = self.state();
            match state.peers.get(peer).cloned() {
                Some(connection) => connection,
                None => {
                    let deferred: usize = state.deferred.values().map(Vec::len).sum();
                    if deferred >= MAX_DEFERRED_SIGNALS {
                        warn!(
                            "dropping signal from unknown peer {}: too many deferred signals",
                            peer
                        );
                    } else {
                        debug!("deferring signal from unknown peer {}", peer);
                        state.deferred.entry(peer.clone()).or_default().push(signal);
                    }
                    return Ok(());
                }
            }
        };
        connection.signal(signal).await
    }

    /// Removes `connection` from the pool and closes it, unless the pool already
    /// replaced it.
    pub fn remove(&self, connection: &PeerConnection) {
        let mut state = self.state();
        if let Some(current) = state.peers.get(connection.id()) {
            if current.ptr_eq(connection) {
                state.peers.remove(connection.id());
            }
        }
        connection.close();
    }

    /// Closes and removes every connection that is not established.
    pub fn prune(&self) {
        let mut state = self.state();
        state.peers.retain(|id, connection| {
            let connected = connection.state() == PeerState::Connected;
            if !connected {
                debug!("pruning connection to peer {}", id);
                connection.close();
            }
            connected
        });
    }

    /// Closes and removes every connection.
    pub fn shutdown(&self) {
        let mut state = self.state();
        for (_, connection) in state.peers.drain() {
            connection.close();
        }
        state.deferred.clear();
    }
}
