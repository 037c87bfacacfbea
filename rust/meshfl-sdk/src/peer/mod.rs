//! A point-to-point connection to another node.
//!
//! A [`Peer`] wraps a [`Datagram`] socket. The connection is established by
//! exchanging two [`Signal`]s through the rendezvous server: the initiator sends an
//! offer, the other side answers. Both signals carry a [`SessionDescription`]
//! advertising the candidate address of the sender and the largest message it
//! accepts.
//!
//! Messages can be sent before the connection is established: they are queued
//! until the maximum message size is known. Every message is then split into
//! chunks, which are flushed as long as the socket has room for them.
//!
//! Everything a peer observes is reported as a [`PeerEvent`].

pub mod sdp;

use std::{
    cmp,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, warn};

pub use self::sdp::{SdpError, SessionDescription};
use crate::transport::{Datagram, Transport, TransportError};
use meshfl_core::{
    message::{ChunkError, Chunker, Reassembler, Signal},
    NodeId,
};

/// The interval between two attempts to flush a chunk that doesn't fit into the
/// socket buffer.
pub const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
/// Errors related to peer connections.
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid session description: {0}")]
    Sdp(#[from] SdpError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("the maximum message size was already negotiated")]
    MaxMessageSizeAlreadySet,
    #[error("unexpected {0} signal")]
    UnexpectedSignal(&'static str),
    #[error("the connection is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a [`Peer`] observed.
pub enum PeerEvent {
    /// A signal to relay to the remote side.
    Signal(Signal),
    /// The connection is established.
    Connect,
    /// A message was received.
    Data(Vec<u8>),
    /// The connection is closed.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The state of a [`Peer`].
pub enum PeerState {
    New,
    Connected,
    Closed,
}

#[derive(Default)]
struct Outgoing {
    chunker: Option<Chunker>,
    /// Messages sent before the maximum message size was known.
    pending: Vec<Vec<u8>>,
    /// Chunks waiting to be flushed.
    queue: VecDeque<Vec<u8>>,
}

struct PeerInner {
    id: NodeId,
    initiator: bool,
    socket: Arc<dyn Datagram>,
    max_message_size: usize,
    outgoing: Mutex<Outgoing>,
    wake: Notify,
    state: watch::Sender<PeerState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
/// A connection to a remote node.
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Creates a connection to the node `id` over a new socket of `transport`.
    ///
    /// If `initiator` is set, the offer is emitted right away.
    ///
    /// # Errors
    /// Fails if no socket can be bound.
    pub async fn new(
        id: NodeId,
        initiator: bool,
        transport: &dyn Transport,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let socket = transport.bind().await?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(PeerState::New);
        let peer = Self {
            inner: Arc::new(PeerInner {
                id,
                initiator,
                socket,
                max_message_size: transport.max_message_size(),
                outgoing: Mutex::new(Outgoing::default()),
                wake: Notify::new(),
                state,
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        if initiator {
            let offer = Signal::Offer {
                sdp: peer.inner.local_description().to_sdp(),
            };
            let _ = peer.inner.events.send(PeerEvent::Signal(offer));
        }
        Ok((peer, events_rx))
    }

    /// Gets the id of the remote node.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.borrow()
    }

    /// Checks whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handles a signal from the remote node.
    ///
    /// # Errors
    /// Fails if the signal doesn't match the role of this side, if its session
    /// description is invalid, or if a session description was already applied.
    pub async fn signal(&self, signal: Signal) -> Result<(), PeerError> {
        match (&signal, self.inner.initiator) {
            (Signal::Offer { .. }, true) => return Err(PeerError::UnexpectedSignal("offer")),
            (Signal::Answer { .. }, false) => return Err(PeerError::UnexpectedSignal("answer")),
            _ => {}
        }
        let remote = SessionDescription::parse(signal.sdp())?;
        self.inner.set_max_message_size(remote.max_message_size)?;
        self.inner.socket.connect(&remote.candidate).await?;

        if let Signal::Offer { .. } = signal {
            let answer = Signal::Answer {
                sdp: self.inner.local_description().to_sdp(),
            };
            let _ = self.inner.events.send(PeerEvent::Signal(answer));
        }
        self.start();
        Ok(())
    }

    /// Sends a message, or queues it until the connection is established.
    ///
    /// # Errors
    /// Fails if the connection is closed or if the message can't be chunked.
    pub fn send(&self, message: &[u8]) -> Result<(), PeerError> {
        if self.state() == PeerState::Closed {
            return Err(PeerError::Closed);
        }
        {
            let mut guard = self.inner.outgoing();
            let outgoing = &mut *guard;
            match outgoing.chunker.as_mut() {
                Some(chunker) => outgoing.queue.extend(chunker.chunk(message)?),
                None => outgoing.pending.push(message.to_vec()),
            }
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Waits until the connection is established.
    ///
    /// # Errors
    /// Fails if the connection is closed first.
    pub async fn connected(&self) -> Result<(), PeerError> {
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                PeerState::Connected => return Ok(()),
                PeerState::Closed => return Err(PeerError::Closed),
                PeerState::New => {}
            }
            state.changed().await.map_err(|_| PeerError::Closed)?;
        }
    }

    /// Closes the connection.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    fn start(&self) {
        let flush = tokio::spawn(flush(self.inner.clone()));
        let receive = tokio::spawn(receive(self.inner.clone()));
        self.inner.tasks().extend(vec![flush, receive]);

        if self.inner.state.send_replace(PeerState::Connected) == PeerState::Closed {
            // closed while connecting
            self.inner.shutdown();
            return;
        }
        debug!("connected to peer {}", self.inner.id);
        let _ = self.inner.events.send(PeerEvent::Connect);
        self.inner.wake.notify_one();
    }
}

impl PeerInner {
    fn outgoing(&self) -> MutexGuard<'_, Outgoing> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_description(&self) -> SessionDescription {
        SessionDescription {
            candidate: self.socket.local_candidate(),
            max_message_size: self.max_message_size,
        }
    }

    /// Applies the maximum message size advertised by the remote node and chunks
    /// the messages sent so far.
    fn set_max_message_size(&self, remote: usize) -> Result<(), PeerError> {
        let mut guard = self.outgoing();
        let outgoing = &mut *guard;
        if outgoing.chunker.is_some() {
            return Err(PeerError::MaxMessageSizeAlreadySet);
        }
        let mut chunker = Chunker::new(cmp::min(remote, self.max_message_size))?;
        for message in outgoing.pending.drain(..) {
            outgoing.queue.extend(chunker.chunk(&message)?);
        }
        outgoing.chunker = Some(chunker);
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.outgoing()
            .chunker
            .as_ref()
            .map_or(0, Chunker::max_chunk_size)
    }

    fn shutdown(&self) {
        if self.state.send_replace(PeerState::Closed) == PeerState::Closed {
            return;
        }
        debug!("closing connection to peer {}", self.id);
        self.socket.close();
        let _ = self.events.send(PeerEvent::Close);
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

/// Flushes queued chunks while the socket buffer has room for them.
async fn flush(inner: Arc<PeerInner>) {
    let buffer_size = inner.buffer_size();
    loop {
        let next = inner.outgoing().queue.front().cloned();
        let chunk = match next {
            Some(chunk) => chunk,
            None => {
                inner.wake.notified().await;
                continue;
            }
        };
        if chunk.len() > buffer_size.saturating_sub(inner.socket.buffered_amount()) {
            sleep(TICK).await;
            continue;
        }
        if let Err(err) = inner.socket.send(&chunk).await {
            warn!("failed to send to peer {}: {}", inner.id, err);
            inner.shutdown();
            return;
        }
        inner.outgoing().queue.pop_front();
    }
}

/// Reassembles incoming chunks into messages.
async fn receive(inner: Arc<PeerInner>) {
    let mut reassembler = Reassembler::new();
    loop {
        let datagram = match inner.socket.recv().await {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!("connection to peer {} lost: {}", inner.id, err);
                break;
            }
        };
        match reassembler.push(&datagram) {
            Ok(Some(message)) => {
                if inner.events.send(PeerEvent::Data(message)).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!("protocol violation by peer {}: {}", inner.id, err);
                break;
            }
        }
    }
    inner.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    async fn next_signal(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Signal {
        loop {
            match events.recv().await {
                Some(PeerEvent::Signal(signal)) => return signal,
                Some(_) => continue,
                None => panic!("events closed"),
            }
        }
    }

    async fn next_data(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<u8> {
        loop {
            match events.recv().await {
                Some(PeerEvent::Data(data)) => return data,
                Some(_) => continue,
                None => panic!("events closed"),
            }
        }
    }

    type Events = mpsc::UnboundedReceiver<PeerEvent>;

    async fn connected_pair(transport: &MemoryTransport) -> ((Peer, Events), (Peer, Events)) {
        let (a, mut a_events) = Peer::new(NodeId::from("b"), true, transport).await.unwrap();
        let (b, mut b_events) = Peer::new(NodeId::from("a"), false, transport).await.unwrap();
        b.signal(next_signal(&mut a_events).await).await.unwrap();
        a.signal(next_signal(&mut b_events).await).await.unwrap();
        a.connected().await.unwrap();
        b.connected().await.unwrap();
        ((a, a_events), (b, b_events))
    }

    #[tokio::test]
    async fn test_small_message() {
        let transport = MemoryTransport::new(64);
        let ((a, _a_events), (_b, mut b_events)) = connected_pair(&transport).await;
        a.send(b"hello").unwrap();
        assert_eq!(next_data(&mut b_events).await, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_back_to_back_messages() {
        let transport = MemoryTransport::new(64);
        let ((a, mut a_events), (b, mut b_events)) = connected_pair(&transport).await;
        let messages: Vec<Vec<u8>> = (0..5)
            .map(|i| (0..1000 + i).map(|j| (j % 251) as u8).collect())
            .collect();
        for message in messages.iter() {
            a.send(message).unwrap();
            b.send(message).unwrap();
        }
        for message in messages.iter() {
            assert_eq!(next_data(&mut b_events).await, *message);
            assert_eq!(next_data(&mut a_events).await, *message);
        }
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = MemoryTransport::new(64);
        let (a, mut a_events) = Peer::new(NodeId::from("b"), true, &transport).await.unwrap();
        let (b, mut b_events) = Peer::new(NodeId::from("a"), false, &transport).await.unwrap();
        a.send(&[7; 300]).unwrap();
        assert_eq!(a.state(), PeerState::New);

        b.signal(next_signal(&mut a_events).await).await.unwrap();
        a.signal(next_signal(&mut b_events).await).await.unwrap();
        assert_eq!(next_data(&mut b_events).await, vec![7; 300]);
    }

    #[tokio::test]
    async fn test_signal_errors() {
        let transport = MemoryTransport::new(64);
        let (a, mut a_events) = Peer::new(NodeId::from("b"), true, &transport).await.unwrap();
        let (b, _b_events) = Peer::new(NodeId::from("a"), false, &transport).await.unwrap();
        let offer = next_signal(&mut a_events).await;

        assert!(matches!(
            a.signal(offer.clone()).await.unwrap_err(),
            PeerError::UnexpectedSignal("offer")
        ));
        assert!(matches!(
            b.signal(Signal::Offer {
                sdp: "a=candidate:memory:0\r\n".to_string()
            })
            .await
            .unwrap_err(),
            PeerError::Sdp(SdpError::MissingMaxMessageSize)
        ));
        b.signal(offer.clone()).await.unwrap();
        assert!(matches!(
            b.signal(offer).await.unwrap_err(),
            PeerError::MaxMessageSizeAlreadySet
        ));
    }

    #[tokio::test]
    async fn test_flush_waits_for_headroom() {
        let transport = MemoryTransport::new(64);
        let ((a, _a_events), (_b, mut b_events)) = connected_pair(&transport).await;

        // no room left in the socket buffer
        transport.set_buffered_amount(64);
        a.send(b"hello").unwrap();
        assert!(tokio::time::timeout(TICK * 5, next_data(&mut b_events))
            .await
            .is_err());
        assert_eq!(a.inner.outgoing().queue.len(), 1);

        transport.set_buffered_amount(0);
        assert_eq!(next_data(&mut b_events).await, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_close() {
        let transport = MemoryTransport::new(64);
        let ((a, mut a_events), _b) = connected_pair(&transport).await;
        a.close();
        assert_eq!(a.state(), PeerState::Closed);
        assert!(matches!(a.send(b"late").unwrap_err(), PeerError::Closed));
        assert!(matches!(a.connected().await.unwrap_err(), PeerError::Closed));
        loop {
            if a_events.recv().await == Some(PeerEvent::Close) {
                break;
            }
        }
    }
}
