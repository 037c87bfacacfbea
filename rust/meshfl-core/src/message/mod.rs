//! Messages exchanged by nodes.
//!
//! Two protocols are involved:
//!
//! - the [rendezvous] protocol between a node and the rendezvous server, used to
//!   obtain a node id, announce readiness, learn the peers of a round and relay
//!   connection-establishment signals.
//! - the [peer] protocol between two nodes, carrying serialized weights.
//!
//! Messages are encoded with `bincode`. Encoded peer messages can exceed the
//! maximum message size of a peer transport and are therefore split into
//! [chunk]s.
//!
//! [rendezvous]: crate::message::rendezvous
//! [peer]: crate::message::peer
//! [chunk]: crate::message::chunk

pub mod chunk;
pub mod peer;
pub mod rendezvous;

use anyhow::Context;
use thiserror::Error;

pub use self::{
    chunk::{ChunkBuffer, ChunkError, Chunker, Reassembler},
    peer::{PayloadKind, PeerMessage, PeerPayload},
    rendezvous::{ClientMessage, ServerMessage, Signal},
};
use crate::weights::WeightsContainer;

/// An error that signals a failure when trying to decrypt and parse a message.
pub type DecodeError = anyhow::Error;

#[derive(Debug, Error)]
#[error("failed to encode message: {0}")]
/// An error that signals a failure when serializing a message.
pub struct EncodeError(#[from] bincode::Error);

/// An interface for serializable message types.
pub trait ToBytes {
    /// Serializes the message into a new buffer.
    fn to_bytes(&self) -> Result<Vec<u8>, EncodeError>;
}

/// An interface for deserializable message types.
pub trait FromBytes: Sized {
    /// Deserializes the message from a byte slice.
    fn from_byte_slice(bytes: &[u8]) -> Result<Self, DecodeError>;
}

macro_rules! impl_bincode_codec {
    ($ty:ty, $name:expr) => {
        impl ToBytes for $ty {
            fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
                bincode::serialize(self).map_err(EncodeError::from)
            }
        }

        impl FromBytes for $ty {
            fn from_byte_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
                bincode::deserialize(bytes).context(concat!("invalid ", $name))
            }
        }
    };
}

impl_bincode_codec!(WeightsContainer, "weights");
impl_bincode_codec!(PeerMessage, "peer message");
impl_bincode_codec!(ClientMessage, "client message");
impl_bincode_codec!(ServerMessage, "server message");
