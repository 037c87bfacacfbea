//! Messages of the peer protocol.

use serde::{Deserialize, Serialize};

use crate::{
    message::{DecodeError, EncodeError, FromBytes, ToBytes},
    weights::WeightsContainer,
    NodeId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The kind of weights carried by a [`PeerMessage`].
pub enum PayloadKind {
    /// A full local update.
    Weights,
    /// One additive share of a local update.
    Shares,
    /// The sum of the shares a node received.
    PartialSums,
}

impl PayloadKind {
    /// Gets the communication round in which payloads of this kind are exchanged.
    pub fn communication_round(self) -> usize {
        match self {
            PayloadKind::Weights | PayloadKind::Shares => 0,
            PayloadKind::PartialSums => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The content of a [`PeerMessage`].
pub struct PeerPayload {
    /// The sender.
    pub peer: NodeId,
    /// The aggregation round of the sender.
    pub round: u64,
    /// The serialized weights.
    pub payload: Vec<u8>,
}

impl PeerPayload {
    /// Deserializes the weights.
    pub fn weights(&self) -> Result<WeightsContainer, DecodeError> {
        WeightsContainer::from_byte_slice(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message exchanged between two peers.
pub enum PeerMessage {
    Weights(PeerPayload),
    Shares(PeerPayload),
    PartialSums(PeerPayload),
}

impl PeerMessage {
    /// Creates a message of the given kind carrying `weights`.
    pub fn new(
        kind: PayloadKind,
        peer: NodeId,
        round: u64,
        weights: &WeightsContainer,
    ) -> Result<Self, EncodeError> {
        let payload = PeerPayload {
            peer,
            round,
            payload: weights.to_bytes()?,
        };
        Ok(match kind {
            PayloadKind::Weights => PeerMessage::Weights(payload),
            PayloadKind::Shares => PeerMessage::Shares(payload),
            PayloadKind::PartialSums => PeerMessage::PartialSums(payload),
        })
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            PeerMessage::Weights(_) => PayloadKind::Weights,
            PeerMessage::Shares(_) => PayloadKind::Shares,
            PeerMessage::PartialSums(_) => PayloadKind::PartialSums,
        }
    }

    pub fn payload(&self) -> &PeerPayload {
        match self {
            PeerMessage::Weights(payload)
            | PeerMessage::Shares(payload)
            | PeerMessage::PartialSums(payload) => payload,
        }
    }

    pub fn into_parts(self) -> (PayloadKind, PeerPayload) {
        let kind = self.kind();
        match self {
            PeerMessage::Weights(payload)
            | PeerMessage::Shares(payload)
            | PeerMessage::PartialSums(payload) => (kind, payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_message() {
        let weights = WeightsContainer::from(vec![vec![1.0, 2.0], vec![3.0]]);
        let message =
            PeerMessage::new(PayloadKind::PartialSums, NodeId::from("a"), 7, &weights).unwrap();
        assert_eq!(message.kind(), PayloadKind::PartialSums);
        assert_eq!(message.kind().communication_round(), 1);

        let bytes = message.to_bytes().unwrap();
        let (kind, payload) = PeerMessage::from_byte_slice(&bytes).unwrap().into_parts();
        assert_eq!(kind, PayloadKind::PartialSums);
        assert_eq!(payload.peer, NodeId::from("a"));
        assert_eq!(payload.round, 7);
        assert_eq!(payload.weights().unwrap(), weights);
    }
}
