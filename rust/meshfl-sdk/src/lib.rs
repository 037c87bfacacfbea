#![cfg_attr(docsrs, feature(doc_cfg))]
//! `meshfl-sdk` turns a process into a node of a decentralized aggregation group.
//!
//! A node needs two channels:
//!
//! - a channel to the rendezvous server ([`signaling`]), which assigns node ids,
//!   tells the nodes which peers take part in a round and relays the signals
//!   that establish peer connections.
//! - direct connections to its peers ([`peer`], [`pool`]), over which the
//!   aggregation payloads travel. Each connection is backed by a datagram socket
//!   of a [`transport`].
//!
//! The [`client::DecentralizedClient`] runs the round protocol on top of both, and
//! [`settings`] loads its configuration.
//!
//! # Running a node
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use meshfl_core::{aggregator::AggregatorSettings, privacy::PrivacySettings, WeightsContainer};
//! # use meshfl_sdk::{client::DecentralizedClient, settings::ProtocolSettings, signaling, transport::UdpTransport};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let url: url::Url = "ws://127.0.0.1:8081/rendezvous/mnist".parse()?;
//! let (sender, receiver) = signaling::connect(&url).await?;
//!
//! let mut client = DecentralizedClient::new(
//!     ProtocolSettings::default(),
//!     AggregatorSettings::default().build()?,
//!     Box::new(PrivacySettings::default()),
//!     Arc::new(UdpTransport::new([0, 0, 0, 0].into(), [127, 0, 0, 1].into(), 16_384)),
//! );
//! client.connect(sender, receiver).await?;
//!
//! let stale = WeightsContainer::from(vec![vec![0.0; 10]]);
//! let update = WeightsContainer::from(vec![vec![1.0; 10]]);
//! let aggregate = client.on_round_end_communication(update, &stale, 1).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod peer;
pub mod pool;
pub mod settings;
pub mod signaling;
pub mod transport;
