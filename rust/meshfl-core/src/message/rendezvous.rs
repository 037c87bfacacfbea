//! Messages of the rendezvous protocol.
//!
//! A node connects to the rendezvous server and sends
//! [`ClientMessage::ClientConnected`]; the server answers with
//! [`ServerMessage::AssignNodeId`]. At the end of every training round the node
//! sends [`ClientMessage::PeerIsReady`] and the server eventually answers with the
//! peers of the round. Connection-establishment [`Signal`]s between two nodes are
//! relayed by the server: a node addresses a signal to a peer and the server
//! delivers it with the `peer` field set to the sender.

use serde::{Deserialize, Serialize};

use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A connection-establishment signal.
///
/// Both variants carry a session description advertising how the sender can be
/// reached and the maximum message size it accepts.
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
}

impl Signal {
    pub fn sdp(&self) -> &str {
        match self {
            Signal::Offer { sdp } | Signal::Answer { sdp } => sdp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A message from a node to the rendezvous server.
pub enum ClientMessage {
    ClientConnected,
    PeerIsReady,
    /// Relay `signal` to `peer`.
    SignalForPeer { peer: NodeId, signal: Signal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A message from the rendezvous server to a node.
pub enum ServerMessage {
    AssignNodeId { id: NodeId },
    /// The peers of the upcoming round, excluding the recipient.
    PeersForRound { peers: Vec<NodeId> },
    /// A signal sent by `peer`.
    SignalForPeer { peer: NodeId, signal: Signal },
}
