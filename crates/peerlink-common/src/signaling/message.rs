//! Signaling messages exchanged over the relay.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::core::error::ProtocolError;
use crate::core::identity::{PeerIdentity, SessionId};

/// Event kind of an SDP offer.
pub const KIND_OFFER: u16 = 5010;
/// Event kind of an SDP answer.
pub const KIND_ANSWER: u16 = 5011;
/// Event kind of a trickled ICE candidate.
pub const KIND_ICE_CANDIDATE: u16 = 5012;
/// Event kind of a file catalog announcement (replaceable).
pub const KIND_CATALOG: u16 = 10020;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_u16(self) -> u16 {
        match self {
            SignalKind::Offer => KIND_OFFER,
            SignalKind::Answer => KIND_ANSWER,
            SignalKind::IceCandidate => KIND_ICE_CANDIDATE,
        }
    }

    pub fn from_u16(kind: u16) -> Option<Self> {
        match kind {
            KIND_OFFER => Some(SignalKind::Offer),
            KIND_ANSWER => Some(SignalKind::Answer),
            KIND_ICE_CANDIDATE => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }
}

/// One offer, answer or ICE candidate.
///
/// `payload` is the base64 of the SDP text (offer, answer) or of the
/// candidate JSON (ICE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// Relay event id, set once the message has been published or received.
    pub id: Option<String>,
    pub kind: SignalKind,
    pub sender: PeerIdentity,
    pub recipient: PeerIdentity,
    pub session_id: SessionId,
    /// Answers reference the offer's event id. Candidates carry the
    /// session id here.
    pub ref_id: Option<String>,
    pub payload: String,
}

impl SignalingMessage {
    pub fn offer(
        sender: PeerIdentity,
        recipient: PeerIdentity,
        session_id: SessionId,
        sdp: &str,
    ) -> Self {
        Self {
            id: None,
            kind: SignalKind::Offer,
            sender,
            recipient,
            session_id,
            ref_id: None,
            payload: STANDARD.encode(sdp),
        }
    }

    pub fn answer(
        sender: PeerIdentity,
        recipient: PeerIdentity,
        session_id: SessionId,
        offer_ref: String,
        sdp: &str,
    ) -> Self {
        Self {
            id: None,
            kind: SignalKind::Answer,
            sender,
            recipient,
            session_id,
            ref_id: Some(offer_ref),
            payload: STANDARD.encode(sdp),
        }
    }

    pub fn ice_candidate(
        sender: PeerIdentity,
        recipient: PeerIdentity,
        session_id: SessionId,
        candidate_json: &str,
    ) -> Self {
        Self {
            id: None,
            kind: SignalKind::IceCandidate,
            sender,
            recipient,
            ref_id: Some(session_id.to_string()),
            session_id,
            payload: STANDARD.encode(candidate_json),
        }
    }

    /// Decode the payload back into SDP text or candidate JSON.
    pub fn descriptor(&self) -> Result<String, ProtocolError> {
        let bytes = STANDARD
            .decode(self.payload.trim())
            .map_err(|e| ProtocolError::SignalingDecode(format!("invalid base64: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| ProtocolError::SignalingDecode(format!("invalid UTF-8: {}", e)))
    }
}
