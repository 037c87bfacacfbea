#![cfg_attr(docsrs, feature(doc_cfg))]
//! `meshfl-core` provides the building blocks of round-synchronized decentralized
//! aggregation.
//!
//! A group of nodes jointly improves a shared model without a trusted central party
//! holding their raw updates. In every round, each node computes a local update,
//! exchanges it with the other members of its group and combines what it receives
//! according to an aggregation scheme:
//!
//! - **mean**: every node broadcasts its update, every node averages what it
//!   collected once enough contributions arrived.
//! - **secure**: every node splits its update into additive shares and sends one
//!   share to each member of the group. Each node sums the shares it receives into
//!   a partial sum, broadcasts that partial sum and finally averages all partial
//!   sums. No single node ever sees another node's update in clear.
//!
//! This crate contains everything that does not depend on a network stack:
//!
//! - [`weights`] and [`aggregation`]: the numeric payloads and the element-wise
//!   arithmetic on them.
//! - [`aggregator`]: the round/communication-round state machine and the mean and
//!   secure aggregation policies built on top of it.
//! - [`buffer`]: a capacity-bounded contribution buffer for asynchronous
//!   aggregation.
//! - [`stats`]: an observer collecting participation statistics.
//! - [`message`]: the rendezvous and peer messages, their binary encoding and the
//!   fragmentation of encoded messages into size-limited chunks.
//! - [`privacy`]: update clipping and noising applied before an update leaves the
//!   node.
//!
//! The peer-to-peer transport, the peer pool and the client round protocol live in
//! `meshfl-sdk`; the rendezvous server lives in `meshfl-server`.

pub mod aggregation;
pub mod aggregator;
pub mod buffer;
pub mod message;
pub mod privacy;
pub mod stats;
pub mod weights;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

pub use self::weights::{SharedWeights, Tensor, WeightsContainer, WeightsError};

#[derive(
    Debug, Display, From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
/// The identity of a node.
///
/// Node ids are assigned by the rendezvous server and stay stable for the lifetime
/// of the connection to that server. They are compared lexicographically.
pub struct NodeId(String);

impl NodeId {
    /// Gets the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
