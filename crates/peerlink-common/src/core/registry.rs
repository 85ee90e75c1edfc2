//! Session registry: every signaling session and transfer engine of a node.
//!
//! Inbound signaling messages are routed here by session id. Sessions live
//! until they hand their channel to an engine or terminate; engines live
//! until their channel closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

use crate::core::engine::TransferEngine;
use crate::core::error::ProtocolError;
use crate::core::identity::{PeerIdentity, SessionId};
use crate::core::session::{Role, SignalingSession, SignalingState};
use crate::signaling::message::{SignalKind, SignalingMessage};
use crate::transport::PeerTransport;

/// Number of finished session ids remembered so that a redelivered offer
/// does not start the same session again.
const RETIRED_SESSION_CAPACITY: usize = 1024;

/// A session in handshake together with its peer connection.
pub struct SessionSlot {
    pub session: SignalingSession,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub deadline: Instant,
}

impl SessionSlot {
    pub fn new(
        session: SignalingSession,
        transport: Arc<dyn PeerTransport>,
        deadline: Instant,
    ) -> Self {
        Self {
            session,
            transport: Some(transport),
            deadline,
        }
    }
}

/// Where an inbound signaling message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// An offer for a session id never seen before.
    NewSession,
    /// An offer for a session that already exists or existed.
    Duplicate,
    /// An answer or candidate for a live session.
    Existing,
}

/// Read-only view of one session or engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub peer: PeerIdentity,
    pub role: Role,
    pub state: SignalingState,
}

pub struct SessionRegistry {
    local: PeerIdentity,
    sessions: HashMap<SessionId, SessionSlot>,
    engines: HashMap<SessionId, TransferEngine>,
    /// Most recent engine per peer.
    peers: HashMap<PeerIdentity, SessionId>,
    retired: VecDeque<SessionId>,
    retired_set: HashSet<SessionId>,
}

impl SessionRegistry {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            sessions: HashMap::new(),
            engines: HashMap::new(),
            peers: HashMap::new(),
            retired: VecDeque::new(),
            retired_set: HashSet::new(),
        }
    }

    /// Decide where a message goes. Messages for other identities and
    /// answers or candidates for unknown sessions are rejected.
    pub fn route(&self, message: &SignalingMessage) -> Result<Route, ProtocolError> {
        if message.recipient != self.local {
            return Err(ProtocolError::NotForUs);
        }

        let id = &message.session_id;
        match message.kind {
            SignalKind::Offer => {
                if self.sessions.contains_key(id)
                    || self.engines.contains_key(id)
                    || self.retired_set.contains(id)
                {
                    Ok(Route::Duplicate)
                } else {
                    Ok(Route::NewSession)
                }
            }
            SignalKind::Answer | SignalKind::IceCandidate => match self.sessions.get(id) {
                Some(slot) if slot.session.peer() != message.sender => {
                    Err(ProtocolError::UnexpectedSender(id.to_string()))
                }
                Some(_) => Ok(Route::Existing),
                None => Err(ProtocolError::UnknownSession(id.to_string())),
            },
        }
    }

    pub fn insert_session(&mut self, slot: SessionSlot) {
        let id = slot.session.session_id().clone();
        self.sessions.insert(id, slot);
    }

    pub fn session(&self, id: &SessionId) -> Option<&SessionSlot> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionSlot> {
        self.sessions.get_mut(id)
    }

    /// Remove a session and remember its id as used.
    pub fn remove_session(&mut self, id: &SessionId) -> Option<SessionSlot> {
        let slot = self.sessions.remove(id)?;
        self.retire(id.clone());
        Some(slot)
    }

    /// Sessions still handshaking past their deadline.
    pub fn expired_sessions(&self, now: Instant) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, slot)| slot.session.state().is_handshaking() && now >= slot.deadline)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids of sessions that have connected or terminated and can go.
    pub fn finished_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, slot)| !slot.session.state().is_handshaking())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Handshaking sessions with the given peer.
    pub fn sessions_with(&self, peer: &PeerIdentity) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, slot)| slot.session.peer() == *peer)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn insert_engine(&mut self, engine: TransferEngine) {
        let id = engine.session_id().clone();
        self.peers.insert(engine.peer(), id.clone());
        self.engines.insert(id, engine);
    }

    pub fn engine_mut(&mut self, id: &SessionId) -> Option<&mut TransferEngine> {
        self.engines.get_mut(id)
    }

    pub fn engine_for_peer_mut(&mut self, peer: &PeerIdentity) -> Option<&mut TransferEngine> {
        let id = self.peers.get(peer)?;
        self.engines.get_mut(id)
    }

    pub fn engine_ids(&self) -> Vec<SessionId> {
        self.engines.keys().cloned().collect()
    }

    /// Engines with the given peer, most recent first.
    pub fn engines_with(&self, peer: &PeerIdentity) -> Vec<SessionId> {
        let latest = self.peers.get(peer);
        let mut ids: Vec<SessionId> = self
            .engines
            .iter()
            .filter(|(_, engine)| engine.peer() == *peer)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by_key(|id| Some(id) != latest);
        ids
    }

    pub fn remove_engine(&mut self, id: &SessionId) -> Option<TransferEngine> {
        let engine = self.engines.remove(id)?;
        let peer = engine.peer();
        if self.peers.get(&peer) == Some(id) {
            self.peers.remove(&peer);
            // Fall back to another open engine with the same peer
            if let Some(other) = self
                .engines
                .iter()
                .find(|(_, e)| e.peer() == peer)
                .map(|(other, _)| other.clone())
            {
                self.peers.insert(peer, other);
            }
        }
        self.retire(id.clone());
        Some(engine)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let handshaking = self.sessions.values().map(|slot| SessionInfo {
            session_id: slot.session.session_id().clone(),
            peer: slot.session.peer(),
            role: slot.session.role(),
            state: slot.session.state().clone(),
        });
        let connected = self.engines.values().map(|engine| SessionInfo {
            session_id: engine.session_id().clone(),
            peer: engine.peer(),
            role: engine.role(),
            state: SignalingState::Connected,
        });

        let mut all: Vec<SessionInfo> = handshaking.chain(connected).collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn retire(&mut self, id: SessionId) {
        if !self.retired_set.insert(id.clone()) {
            return;
        }
        self.retired.push_back(id);
        while self.retired.len() > RETIRED_SESSION_CAPACITY {
            if let Some(old) = self.retired.pop_front() {
                self.retired_set.remove(&old);
            }
        }
    }
}
