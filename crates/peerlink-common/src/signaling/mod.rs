pub mod bus;
pub mod message;
pub mod nostr_protocol;
