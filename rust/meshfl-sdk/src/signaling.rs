//! The channel to the rendezvous server.
//!
//! Messages to the server go through a [`RendezvousSender`], messages from the
//! server arrive on a [`RendezvousReceiver`]. [`connect`] opens both over a
//! websocket; [`channel`] creates an in-process pair, e.g. to plug a node into an
//! in-process rendezvous server.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use meshfl_core::message::{ClientMessage, FromBytes, ServerMessage, ToBytes};

#[derive(Debug, Error)]
/// Errors related to the rendezvous channel.
pub enum SignalingError {
    #[error("failed to connect to the rendezvous server: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("the rendezvous channel is closed")]
    Closed,
}

/// Messages from the rendezvous server.
pub type RendezvousReceiver = mpsc::UnboundedReceiver<ServerMessage>;

#[derive(Debug, Clone)]
/// A handle to send messages to the rendezvous server.
pub struct RendezvousSender(mpsc::UnboundedSender<ClientMessage>);

impl RendezvousSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self(tx)
    }

    /// Sends a message to the rendezvous server.
    ///
    /// # Errors
    /// Fails if the channel is closed.
    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.0.send(message).map_err(|_| SignalingError::Closed)
    }
}

/// Creates an in-process rendezvous channel.
///
/// Returns the node's sender along with the receiving end of its messages.
pub fn channel() -> (RendezvousSender, mpsc::UnboundedReceiver<ClientMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RendezvousSender(tx), rx)
}

/// Connects to a rendezvous server over a websocket.
///
/// # Errors
/// Fails if the websocket handshake fails.
pub async fn connect(url: &Url) -> Result<(RendezvousSender, RendezvousReceiver), SignalingError> {
    let (socket, _) = connect_async(url.as_str()).await?;
    debug!("connected to rendezvous server at {}", url);
    let (mut sink, mut stream) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (server_tx, server_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(message) = client_rx.recv().await {
            let bytes = match message.to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("dropping message to the rendezvous server: {}", err);
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Binary(bytes)).await {
                warn!("failed to send to the rendezvous server: {}", err);
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Binary(bytes)) => match ServerMessage::from_byte_slice(&bytes) {
                    Ok(message) => {
                        if server_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("invalid message from the rendezvous server: {:#}", err),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("rendezvous connection failed: {}", err);
                    break;
                }
            }
        }
        debug!("rendezvous connection closed");
    });

    Ok((RendezvousSender(client_tx), server_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfl_core::NodeId;
    use meshfl_server::{api, rendezvous::RendezvousHandle, settings::ApiSettings};

    async fn assigned(rx: &mut RendezvousReceiver) -> NodeId {
        match rx.recv().await {
            Some(ServerMessage::AssignNodeId { id }) => id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_websocket_rendezvous() {
        let settings = ApiSettings {
            bind_address: ([127, 0, 0, 1], 0).into(),
        };
        let (address, server) = api::bind(&settings, RendezvousHandle::new(2)).unwrap();
        tokio::spawn(server);
        let url = Url::parse(&format!("ws://{}/rendezvous/task", address)).unwrap();

        let (a_tx, mut a_rx) = connect(&url).await.unwrap();
        let (b_tx, mut b_rx) = connect(&url).await.unwrap();
        a_tx.send(ClientMessage::ClientConnected).unwrap();
        let a = assigned(&mut a_rx).await;
        b_tx.send(ClientMessage::ClientConnected).unwrap();
        let b = assigned(&mut b_rx).await;
        assert_ne!(a, b);

        a_tx.send(ClientMessage::PeerIsReady).unwrap();
        b_tx.send(ClientMessage::PeerIsReady).unwrap();
        assert_eq!(
            a_rx.recv().await.unwrap(),
            ServerMessage::PeersForRound { peers: vec![b] }
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            ServerMessage::PeersForRound { peers: vec![a] }
        );
    }

    #[tokio::test]
    async fn test_channel_closed() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(matches!(
            tx.send(ClientMessage::PeerIsReady).unwrap_err(),
            SignalingError::Closed
        ));
    }
}
