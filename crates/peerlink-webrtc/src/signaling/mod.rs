//! Relay signaling for the WebRTC binary

pub mod nostr;

pub use nostr::NostrSignalBus;
