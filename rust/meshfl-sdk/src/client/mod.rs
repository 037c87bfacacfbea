//! The round protocol of a node.
//!
//! At the end of each local training round, a [`DecentralizedClient`] exchanges its
//! update with the other nodes of the round and returns the aggregate:
//!
//! 1. The node tells the rendezvous server it is ready, and the server answers with
//!    the other nodes of the round once enough of them are ready.
//! 2. The node connects to every one of them it isn't connected to yet.
//! 3. The node applies its privacy transform to the update, then runs every
//!    communication round of the aggregation scheme: it sends each peer its
//!    payload, and waits until the aggregator combined the payloads of the peers.
//!
//! The result future of every exchange is captured as soon as the exchange starts,
//! so an aggregate the peers complete before the node sends its own payload is
//! not lost. A round that fails for any reason falls back to the local update.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    iter,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    pool::{PeerConnection, PeerPool, PoolError},
    settings::ProtocolSettings,
    signaling::{RendezvousReceiver, RendezvousSender, SignalingError},
    transport::Transport,
};
use meshfl_core::{
    aggregator::{Aggregator, AggregatorError, ResultFuture},
    message::{ClientMessage, EncodeError, PeerMessage, ServerMessage},
    privacy::{PrivacyError, PrivacyTransform},
    NodeId,
    WeightsContainer,
};

#[derive(Debug, Error)]
/// Errors related to connecting a node to the rendezvous server.
pub enum ClientError {
    #[error("the node is already connected")]
    AlreadyConnected,
    #[error("the rendezvous server didn't assign a node id in time")]
    Timeout,
    #[error("the rendezvous server disconnected")]
    ServerDisconnected,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
/// Errors that abort a round.
pub enum RoundError {
    #[error("the node is not connected")]
    NotConnected,
    #[error("timed out while waiting for {0}")]
    Timeout(&'static str),
    #[error("the rendezvous server disconnected")]
    ServerDisconnected,
    #[error("the rendezvous server assigned a second node id")]
    DuplicateNodeId,
    #[error("the peer list contains the own node id")]
    SelfInPeerList,
    #[error("the peer list contains duplicates")]
    DuplicatePeerList,
    #[error("the rendezvous server sent a second peer list for the round")]
    UnexpectedPeerList,
    #[error("not enough peers: {available} nodes available, {required} required")]
    NotEnoughPeers { available: usize, required: usize },
    #[error("the aggregator is out of sync with the round")]
    OutOfSync,
    #[error("round {0} was abandoned")]
    Abandoned(u64),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Privacy(#[from] PrivacyError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// An exchange: a round and one of its communication rounds.
type Exchange = (u64, usize);

struct AggregatorState {
    aggregator: Box<dyn Aggregator>,
    /// Payloads that arrived before the round they belong to started.
    early: Vec<PeerMessage>,
    /// The result futures of the exchanges, captured when each one started.
    results: BTreeMap<Exchange, ResultFuture>,
}

#[derive(Clone)]
/// The aggregator of a node, shared with the tasks receiving from its peers.
struct SharedAggregator(Arc<Mutex<AggregatorState>>);

impl SharedAggregator {
    fn new(aggregator: Box<dyn Aggregator>) -> Self {
        let mut state = AggregatorState {
            aggregator,
            early: Vec::new(),
            results: BTreeMap::new(),
        };
        state.track();
        Self(Arc::new(Mutex::new(state)))
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a payload from a peer to the aggregator, or keeps it if its round
    /// hasn't started yet.
    fn receive(&self, message: PeerMessage) {
        let mut state = self.lock();
        state.offer(message);
    }

    /// Starts `round` with the active `nodes` and replays the payloads that arrived
    /// early. Returns the round the aggregator is in.
    fn start_round(&self, round: u64, nodes: BTreeSet<NodeId>) -> u64 {
        let mut state = self.lock();
        let core = state.aggregator.core_mut();
        core.set_round(round);
        core.set_nodes(nodes);
        let round = core.round();
        state.results.retain(|&(result_round, _), _| result_round >= round);
        state.track();
        for message in std::mem::take(&mut state.early) {
            let peer = &message.payload().peer;
            if state.aggregator.core().nodes().contains(peer) {
                state.offer(message);
            } else {
                debug!("dropping payload from inactive node {}", peer);
            }
        }
        round
    }
}

impl AggregatorState {
    /// Gets the exchange the aggregator is in.
    fn exchange(&self) -> Exchange {
        let core = self.aggregator.core();
        (core.round(), core.communication_round())
    }

    /// Captures the result future of the current exchange, unless it was
    /// captured already.
    fn track(&mut self) {
        let exchange = self.exchange();
        if !self.results.contains_key(&exchange) {
            let result = self.aggregator.receive_result();
            self.results.insert(exchange, result);
        }
    }

    fn offer(&mut self, message: PeerMessage) {
        let core = self.aggregator.core();
        let payload = message.payload();
        if payload.round > core.round() || !core.nodes().contains(&payload.peer) {
            debug!(
                "keeping payload from node {} for round {}",
                payload.peer, payload.round
            );
            self.early.push(message);
            return;
        }

        let (kind, payload) = message.into_parts();
        let weights = match payload.weights() {
            Ok(weights) => weights,
            Err(err) => {
                warn!("invalid payload from node {}: {:#}", payload.peer, err);
                return;
            }
        };
        match self.aggregator.add(
            &payload.peer,
            weights,
            payload.round,
            kind.communication_round(),
        ) {
            Ok(true) => self.track(),
            Ok(false) => debug!("payload from node {} rejected", payload.peer),
            Err(err) => warn!("aggregation failed: {}", err),
        }
    }
}

struct Session {
    id: NodeId,
    rendezvous: RendezvousSender,
    control: mpsc::UnboundedReceiver<ServerMessage>,
    pool: PeerPool,
    dispatcher: JoinHandle<()>,
}

/// A node taking part in decentralized aggregation rounds.
pub struct DecentralizedClient {
    settings: ProtocolSettings,
    aggregator: SharedAggregator,
    privacy: Box<dyn PrivacyTransform>,
    transport: Arc<dyn Transport>,
    session: Option<Session>,
}

impl DecentralizedClient {
    pub fn new(
        settings: ProtocolSettings,
        aggregator: Box<dyn Aggregator>,
        privacy: Box<dyn PrivacyTransform>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            aggregator: SharedAggregator::new(aggregator),
            privacy,
            transport,
            session: None,
        }
    }

    /// Gets the id assigned by the rendezvous server, if connected.
    pub fn id(&self) -> Option<&NodeId> {
        self.session.as_ref().map(|session| &session.id)
    }

    /// Runs `f` on the aggregator, e.g. to set its held model or its observer.
    pub fn with_aggregator<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut dyn Aggregator) -> R,
    {
        let mut state = self.aggregator.lock();
        let result = f(state.aggregator.as_mut());
        state.track();
        result
    }

    /// Joins the rendezvous server and waits for the node id it assigns.
    ///
    /// # Errors
    /// Fails if the node is already connected, or if the server disconnects or
    /// doesn't assign an id in time.
    pub async fn connect(
        &mut self,
        rendezvous: RendezvousSender,
        mut receiver: RendezvousReceiver,
    ) -> Result<NodeId, ClientError> {
        if self.session.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        rendezvous.send(ClientMessage::ClientConnected)?;
        let id = timeout(self.settings.round_timeout(), async {
            loop {
                match receiver.recv().await {
                    Some(ServerMessage::AssignNodeId { id }) => return Ok(id),
                    Some(message) => debug!("ignoring {:?} before the node id", message),
                    None => return Err(ClientError::ServerDisconnected),
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)??;
        info!("joined the rendezvous server as node {}", id);

        let pool = PeerPool::new(id.clone(), self.transport.clone());
        let (control_tx, control) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(receiver, pool.clone(), control_tx));
        self.aggregator
            .lock()
            .aggregator
            .core_mut()
            .set_nodes(iter::once(id.clone()));

        self.session = Some(Session {
            id: id.clone(),
            rendezvous,
            control,
            pool,
            dispatcher,
        });
        Ok(id)
    }

    /// Closes every peer connection and leaves the rendezvous server.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            info!("node {} disconnecting", session.id);
            session.pool.shutdown();
            session.dispatcher.abort();
        }
    }

    /// Exchanges the `update` of `round` with the peers and returns the aggregate.
    ///
    /// `stale` holds the weights the update started from, for the privacy
    /// transform. If the exchange fails, `update` is returned unchanged.
    pub async fn on_round_end_communication(
        &mut self,
        update: WeightsContainer,
        stale: &WeightsContainer,
        round: u64,
    ) -> WeightsContainer {
        let node = self.id().map(ToString::to_string).unwrap_or_default();
        match self
            .exchange(&update, stale, round)
            .instrument(info_span!("round", %node, round))
            .await
        {
            Ok(aggregate) => aggregate,
            Err(err) => {
                warn!("round {} failed, keeping the local update: {}", round, err);
                update
            }
        }
    }

    async fn exchange(
        &mut self,
        update: &WeightsContainer,
        stale: &WeightsContainer,
        round: u64,
    ) -> Result<WeightsContainer, RoundError> {
        let session = self.session.as_mut().ok_or(RoundError::NotConnected)?;
        let round_timeout = self.settings.round_timeout();
        while session.control.try_recv().is_ok() {}

        session.rendezvous.send(ClientMessage::PeerIsReady)?;
        let peers = timeout(round_timeout, async {
            loop {
                match session.control.recv().await {
                    Some(ServerMessage::PeersForRound { peers }) => return Ok(peers),
                    Some(ServerMessage::AssignNodeId { .. }) => {
                        return Err(RoundError::DuplicateNodeId)
                    }
                    Some(message) => debug!("ignoring {:?} while waiting for peers", message),
                    None => return Err(RoundError::ServerDisconnected),
                }
            }
        })
        .await
        .map_err(|_| RoundError::Timeout("the peer list"))??;

        let targets: BTreeSet<NodeId> = peers.iter().cloned().collect();
        if targets.contains(&session.id) {
            return Err(RoundError::SelfInPeerList);
        }
        if targets.len() != peers.len() {
            return Err(RoundError::DuplicatePeerList);
        }
        let required = self.settings.minimum_ready_peers;
        if targets.len() + 1 < required {
            return Err(RoundError::NotEnoughPeers {
                available: targets.len() + 1,
                required,
            });
        }
        info!("round with {} peers", targets.len());

        let nodes = targets
            .iter()
            .cloned()
            .chain(iter::once(session.id.clone()))
            .collect();
        let own_round = self.aggregator.start_round(round, nodes);

        let id = &session.id;
        let rendezvous = &session.rendezvous;
        let pool = &session.pool;
        let control = &mut session.control;
        let aggregator = &self.aggregator;
        let privacy = &self.privacy;
        let communicate = async {
            pool.prune();
            let connections = timeout(
                round_timeout,
                pool.get_peers(&targets, rendezvous, |connection| {
                    spawn_receiver(connection, aggregator.clone(), pool.clone())
                }),
            )
            .await
            .map_err(|_| RoundError::Timeout("the peer connections"))??;

            let mut local = privacy.apply(update, stale)?;
            let communication_rounds = aggregator.lock().aggregator.core().communication_rounds();
            for communication_round in 0..communication_rounds {
                local = exchange_once(
                    id,
                    aggregator,
                    &connections,
                    &local,
                    own_round,
                    communication_round,
                    round_timeout,
                )
                .await?;
            }
            Ok::<_, RoundError>(local)
        };

        tokio::select! {
            result = communicate => result,
            err = watch_round(control) => Err(err),
        }
    }
}

impl Drop for DecentralizedClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Runs one communication round: sends each node its payload, then waits for the
/// aggregate.
///
/// If the peers already completed the exchange, the aggregate they produced is
/// returned and the own payload only goes to the peers.
async fn exchange_once(
    id: &NodeId,
    aggregator: &SharedAggregator,
    connections: &HashMap<NodeId, PeerConnection>,
    local: &WeightsContainer,
    round: u64,
    communication_round: usize,
    round_timeout: Duration,
) -> Result<WeightsContainer, RoundError> {
    let result = {
        let mut state = aggregator.lock();
        let result = state
            .results
            .remove(&(round, communication_round))
            .ok_or(RoundError::OutOfSync)?;
        let completed = state.exchange() != (round, communication_round);
        let payloads = state.aggregator.make_payloads(local)?;
        let kind = state.aggregator.payload_kind(communication_round);

        for (node, payload) in payloads {
            if node == *id {
                if completed {
                    debug!(
                        "exchange ({}, {}) completed without the own payload",
                        communication_round, round
                    );
                } else {
                    state
                        .aggregator
                        .add(id, payload, round, communication_round)?;
                    state.track();
                }
                continue;
            }
            match connections.get(&node) {
                Some(connection) => {
                    connection.send(&PeerMessage::new(kind, id.clone(), round, &payload)?)?
                }
                None => warn!("no connection to node {}", node),
            }
        }
        result
    };
    debug!("waiting for the aggregate of ({}, {})", communication_round, round);

    timeout(round_timeout, result)
        .await
        .map_err(|_| RoundError::Timeout("the aggregate"))?
        .map_err(|_| RoundError::Abandoned(round))
}

/// Watches the rendezvous server while a round runs.
///
/// Resolves only if the server breaks the protocol.
async fn watch_round(control: &mut mpsc::UnboundedReceiver<ServerMessage>) -> RoundError {
    loop {
        match control.recv().await {
            Some(ServerMessage::PeersForRound { .. }) => return RoundError::UnexpectedPeerList,
            Some(ServerMessage::AssignNodeId { .. }) => return RoundError::DuplicateNodeId,
            Some(message) => debug!("ignoring {:?} during the round", message),
            // the peers may still complete the round
            None => future::pending::<()>().await,
        }
    }
}

/// Routes signals from the rendezvous server to the peer pool and everything else
/// to the round protocol.
async fn dispatch(
    mut receiver: RendezvousReceiver,
    pool: PeerPool,
    control: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            ServerMessage::SignalForPeer { peer, signal } => {
                if let Err(err) = pool.route_signal(&peer, signal).await {
                    warn!("failed to handle signal from node {}: {}", peer, err);
                }
            }
            message => {
                if control.send(message).is_err() {
                    break;
                }
            }
        }
    }
    debug!("rendezvous channel closed");
}

/// Feeds the payloads received over `connection` to the aggregator, until the
/// connection closes.
fn spawn_receiver(connection: &PeerConnection, aggregator: SharedAggregator, pool: PeerPool) {
    let mut messages = match connection.take_messages() {
        Some(messages) => messages,
        None => return,
    };
    let connection = connection.clone();
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            if message.payload().peer != *connection.id() {
                warn!(
                    "node {} sent a payload on behalf of node {}",
                    connection.id(),
                    message.payload().peer
                );
                continue;
            }
            aggregator.receive(message);
        }
        pool.remove(&connection);
    });
}
