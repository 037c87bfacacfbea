#![cfg_attr(docsrs, feature(doc_cfg))]
//! `meshfl-server` provides the rendezvous server of meshfl.
//!
//! Nodes connect to the server over a websocket at `/rendezvous/<task>`. The server
//! assigns them ids, groups the ready nodes of a task into rounds and relays the
//! signals the nodes exchange to establish their peer connections. The protocol
//! logic lives in [`rendezvous`], the websocket bridge in [`api`].

pub mod api;
pub mod rendezvous;
pub mod settings;
