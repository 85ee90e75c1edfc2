//! peerlink-common: network-free core of peerlink
//!
//! This crate holds everything that does not touch a socket: the per-session
//! signaling state machine, the registry that routes relay messages to
//! sessions, the file transfer protocol spoken over an open data channel,
//! and the node event loop tying them together. The binary crate plugs in
//! a Nostr relay client and WebRTC peer connections through the traits in
//! [`transport`] and [`signaling::bus`].

pub mod config;
pub mod core;
pub mod signaling;
pub mod transport;
