//! Per-connection signaling state machine.
//!
//! [`SignalingSession::handle`] is a pure transition function: it takes an
//! event, updates the state and returns the actions the caller must carry
//! out against the transport and the relay. It never performs I/O itself,
//! which keeps every transition testable without a network.

use std::fmt;
use std::time::Duration;

use crate::core::error::SessionFailure;
use crate::core::identity::{PeerIdentity, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the offer and creates the data channel.
    Initiator,
    /// Answers an inbound offer.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed,
    Failed(SessionFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    OfferSent,
    OfferReceived,
    /// Both descriptions are bound; waiting for the data channel to open.
    AnswerExchanged,
    Connected,
    Terminated(Termination),
}

impl SignalingState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, SignalingState::Terminated(_))
    }

    /// States in which the handshake timeout applies.
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            SignalingState::Idle
                | SignalingState::OfferSent
                | SignalingState::OfferReceived
                | SignalingState::AnswerExchanged
        )
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Idle => write!(f, "idle"),
            SignalingState::OfferSent => write!(f, "offer sent"),
            SignalingState::OfferReceived => write!(f, "offer received"),
            SignalingState::AnswerExchanged => write!(f, "answer exchanged"),
            SignalingState::Connected => write!(f, "connected"),
            SignalingState::Terminated(Termination::Closed) => write!(f, "closed"),
            SignalingState::Terminated(Termination::Failed(cause)) => {
                write!(f, "failed ({})", cause)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Begin the handshake (initiator only).
    Start,
    OfferReceived {
        descriptor: String,
        /// Relay event id of the offer, referenced by the answer.
        offer_id: Option<String>,
    },
    /// The local answer has been created and published.
    AnswerPublished,
    AnswerReceived {
        descriptor: String,
    },
    RemoteCandidate(String),
    LocalCandidate(String),
    ChannelOpen,
    TransportFailed(String),
    HandshakeTimeout(Duration),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Create the data channel and an offer, then publish it.
    CreateOffer,
    /// Bind the remote offer, create an answer and publish it.
    AcceptOffer { descriptor: String, ref_id: String },
    ApplyAnswer { descriptor: String },
    AddCandidates(Vec<String>),
    PublishCandidate(String),
    /// Give the open data channel to a transfer engine.
    HandOff,
    /// Tear the peer connection down.
    Release,
}

#[derive(Debug)]
pub struct SignalingSession {
    session_id: SessionId,
    peer: PeerIdentity,
    role: Role,
    state: SignalingState,
    remote_bound: bool,
    pending_candidates: Vec<String>,
}

impl SignalingSession {
    pub fn new(session_id: SessionId, peer: PeerIdentity, role: Role) -> Self {
        Self {
            session_id,
            peer,
            role,
            state: SignalingState::Idle,
            remote_bound: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SignalingState {
        &self.state
    }

    /// Remote candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        use SessionEvent as E;
        use SignalingState as S;

        if self.state.is_terminated() {
            log::debug!(
                "Session {} already terminated, ignoring {:?}",
                self.session_id,
                event
            );
            return Vec::new();
        }

        match (self.state.clone(), event) {
            (S::Idle, E::Start) if self.role == Role::Initiator => {
                self.state = S::OfferSent;
                vec![SessionAction::CreateOffer]
            }

            (S::Idle, E::OfferReceived { descriptor, offer_id })
                if self.role == Role::Responder =>
            {
                self.state = S::OfferReceived;
                let ref_id = offer_id.unwrap_or_else(|| self.session_id.to_string());
                vec![SessionAction::AcceptOffer { descriptor, ref_id }]
            }

            (S::OfferReceived, E::AnswerPublished) => {
                self.state = S::AnswerExchanged;
                self.bind_remote().into_iter().collect()
            }

            (S::OfferSent, E::AnswerReceived { descriptor }) => {
                self.state = S::AnswerExchanged;
                let mut actions = vec![SessionAction::ApplyAnswer { descriptor }];
                actions.extend(self.bind_remote());
                actions
            }

            (_, E::AnswerReceived { .. }) => {
                log::debug!(
                    "Ignoring answer for session {} in state {}",
                    self.session_id,
                    self.state
                );
                Vec::new()
            }

            (_, E::RemoteCandidate(candidate)) => {
                if self.remote_bound {
                    vec![SessionAction::AddCandidates(vec![candidate])]
                } else {
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            }

            (S::Idle, E::LocalCandidate(_)) => Vec::new(),
            (_, E::LocalCandidate(candidate)) => vec![SessionAction::PublishCandidate(candidate)],

            (S::AnswerExchanged, E::ChannelOpen) => {
                self.state = S::Connected;
                vec![SessionAction::HandOff]
            }

            (_, E::TransportFailed(reason)) => {
                self.fail(SessionFailure::Transport(reason))
            }

            (state, E::HandshakeTimeout(after)) if state.is_handshaking() => {
                self.fail(SessionFailure::HandshakeTimeout(after))
            }

            (_, E::Close) => {
                self.state = S::Terminated(Termination::Closed);
                self.pending_candidates.clear();
                vec![SessionAction::Release]
            }

            (_, event) => {
                log::debug!(
                    "Session {} ignoring {:?} in state {}",
                    self.session_id,
                    event,
                    self.state
                );
                Vec::new()
            }
        }
    }

    fn bind_remote(&mut self) -> Option<SessionAction> {
        self.remote_bound = true;
        if self.pending_candidates.is_empty() {
            None
        } else {
            Some(SessionAction::AddCandidates(std::mem::take(
                &mut self.pending_candidates,
            )))
        }
    }

    fn fail(&mut self, failure: SessionFailure) -> Vec<SessionAction> {
        log::debug!("Session {} failed: {}", self.session_id, failure);
        self.state = SignalingState::Terminated(Termination::Failed(failure));
        self.pending_candidates.clear();
        vec![SessionAction::Release]
    }
}
