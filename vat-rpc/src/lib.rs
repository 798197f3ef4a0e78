//! A peer-to-peer state machine for a capability-passing RPC protocol:
//! Questions/Answers/Imports/Exports tables, promise pipelining, embargoes,
//! call forwarding, and three-party capability handoff, with the wire codec
//! and transport left to the embedding application (see
//! [`message::Transport`]).
//!
//! The entry point is [`rpc::Peer`]: construct one with a [`rpc::PeerConfig`],
//! feed it inbound frames through [`rpc::Peer::handle_frame`], and issue
//! outbound calls through [`rpc::Peer::send_call`].

pub mod broken;
pub mod cap_table;
pub mod error;
pub mod forward;
pub mod local;
pub mod message;
pub mod remap;
pub mod rpc;
pub mod sender_queue;
pub mod tables;

pub use error::{Error, Result};
pub use local::CapabilityHandler;
pub use message::{Message, Transport};
pub use rpc::{Peer, PeerConfig};
