//! Datagram transports.
//!
//! A [`Transport`] creates [`Datagram`] sockets: unreliable, message-oriented,
//! point-to-point channels whose messages are bounded in size. A socket advertises
//! a candidate address through which the remote side can reach it, and is
//! connected to the candidate address of the remote side.

mod memory;
mod udp;

use std::{io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

pub use self::{memory::MemoryTransport, udp::UdpTransport};

#[derive(Debug, Error)]
/// Errors related to datagram transports.
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid candidate address `{0}`")]
    InvalidCandidate(String),
    #[error("no socket behind candidate address `{0}`")]
    UnknownCandidate(String),
    #[error("the socket is not connected")]
    NotConnected,
    #[error("the socket is closed")]
    Closed,
}

#[async_trait]
/// A socket of a [`Transport`].
pub trait Datagram: Send + Sync {
    /// Gets the address through which the remote side can reach this socket.
    fn local_candidate(&self) -> String;

    /// Connects the socket to the candidate address of the remote side.
    async fn connect(&self, candidate: &str) -> Result<(), TransportError>;

    /// Sends one message to the remote side.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receives the next message from the remote side.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Gets the number of bytes queued for sending but not sent yet.
    fn buffered_amount(&self) -> usize;

    /// Closes the socket.
    fn close(&self);
}

#[async_trait]
/// A factory of [`Datagram`] sockets.
pub trait Transport: Send + Sync {
    /// Creates a new socket.
    async fn bind(&self) -> Result<Arc<dyn Datagram>, TransportError>;

    /// Gets the maximum size of a message this transport accepts.
    fn max_message_size(&self) -> usize;
}
