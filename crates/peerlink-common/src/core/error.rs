//! Error types shared across the crate.
//!
//! Plumbing code returns `anyhow::Result`; the enums here are the outcomes
//! callers are expected to match on.

use std::time::Duration;
use thiserror::Error;

/// Problems with an inbound signaling message. None of these are fatal to
/// the node: the message is dropped and the sessions stay untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("signaling payload could not be decoded: {0}")]
    SignalingDecode(String),

    #[error("event is missing the '{0}' tag")]
    MissingTag(&'static str),

    #[error("unsupported event kind {0}")]
    UnknownKind(u16),

    #[error("invalid peer identity: {0}")]
    InvalidIdentity(String),

    #[error("event signature does not verify")]
    BadSignature,

    #[error("message is addressed to another identity")]
    NotForUs,

    #[error("no session with id {0}")]
    UnknownSession(String),

    #[error("session {0} belongs to a different peer")]
    UnexpectedSender(String),
}

/// Failures of a single file request or a send on an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("data channel is not open")]
    ChannelNotReady,

    #[error("peer does not share '{0}'")]
    TargetMissing(String),

    #[error("no data received for {0:?}")]
    Timeout(Duration),

    #[error("data channel closed before the transfer completed")]
    ChannelClosed,

    #[error("incoming file exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("I/O error: {0}")]
    Io(String),
}

/// Why a signaling session ended in `Terminated(Failed)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error("no connection within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("more than one shared file is named '{0}'")]
    DuplicateName(String),
}

/// Replies to commands sent through a `NodeHandle`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("no session with peer {0}")]
    NoSession(String),

    #[error("failed to publish: {0}")]
    Publish(String),

    #[error("failed to create transport: {0}")]
    Transport(String),

    #[error("node has stopped")]
    Stopped,
}

/// Error returned when the user interrupts the program with Ctrl+C.
///
/// This error should be handled at the CLI level by exiting with code 130
/// (standard Unix convention for SIGINT).
#[derive(Debug, Clone, Copy)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Check if an error is an Interrupted error.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Interrupted>().is_some()
}
