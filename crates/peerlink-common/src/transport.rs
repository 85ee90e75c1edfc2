//! Transport seam between the node and a real peer connection.
//!
//! A [`TransportFactory`] creates one [`PeerTransport`] per signaling
//! session. The peer transport performs SDP and ICE work on behalf of the
//! session and reports asynchronous happenings (gathered candidates, channel
//! open, inbound frames, failures) through [`TransportEvents`]. Once the
//! data channel opens, the session hands the [`ChannelTransport`] over to a
//! transfer engine and the peer transport itself is dropped.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::identity::SessionId;
use crate::core::session::Role;

/// One message on the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// File data is subject to the channel's send-buffer limit. Text frames
    /// carry control and chat messages and are sent without waiting.
    pub fn is_flow_controlled(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A locally gathered ICE candidate, serialized as JSON.
    LocalCandidate(String),
    ChannelOpen,
    Frame(Frame),
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub session: SessionId,
    pub kind: TransportEventKind,
}

/// Sender half handed to a transport so its callbacks can reach the node.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    session: SessionId,
    tx: mpsc::Sender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(session: SessionId, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Forward an event to the node. Returns false once the node is gone.
    pub async fn emit(&self, kind: TransportEventKind) -> bool {
        let event = TransportEvent {
            session: self.session.clone(),
            kind,
        };
        if self.tx.send(event).await.is_err() {
            log::debug!(
                "Dropping transport event for session {} - node stopped",
                self.session
            );
            return false;
        }
        true
    }

    pub async fn local_candidate(&self, candidate: String) -> bool {
        self.emit(TransportEventKind::LocalCandidate(candidate)).await
    }

    pub async fn channel_open(&self) -> bool {
        self.emit(TransportEventKind::ChannelOpen).await
    }

    pub async fn frame(&self, frame: Frame) -> bool {
        self.emit(TransportEventKind::Frame(frame)).await
    }

    pub async fn closed(&self) -> bool {
        self.emit(TransportEventKind::Closed).await
    }

    pub async fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEventKind::Failed(reason.into())).await
    }
}

/// An open, reliable, ordered data channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn is_open(&self) -> bool;

    /// Send one frame. Implementations may hold back flow-controlled frames
    /// until the send buffer drains, but must not block other frames on it:
    /// the node loop sends control messages while a serve task fills the
    /// buffer with chunks.
    async fn send(&self, frame: Frame) -> Result<()>;

    async fn close(&self);
}

/// Peer connection driven by a signaling session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the data channel and a local offer. Returns the offer SDP.
    async fn create_offer(&self) -> Result<String>;

    /// Bind the remote offer and create a local answer. Returns the answer SDP.
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String>;

    async fn apply_answer(&self, answer_sdp: &str) -> Result<()>;

    /// Add a remote candidate (JSON as produced by the remote side).
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    /// Take the data channel after `ChannelOpen` was reported. Yields the
    /// channel at most once.
    fn take_channel(&self) -> Option<Arc<dyn ChannelTransport>>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, role: Role, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}
