//! WebRTC transport for the node

pub mod channel;
pub mod peer;

pub use peer::{WebRtcFactory, DEFAULT_STUN_SERVER};
