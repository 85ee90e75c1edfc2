//! The node: one event loop owning the registry, the catalogs and every
//! session and engine.
//!
//! All mutation happens on the loop task. Callers talk to it through a
//! cloneable [`NodeHandle`]; relay traffic arrives on the bus channel, and
//! transport callbacks arrive on the transport channel. Outcomes are
//! reported as [`NodeEvent`]s.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::NodeConfig;
use crate::core::catalog::{
    Catalog, CatalogAnnouncement, CatalogEntry, RemoteCatalogs, SharedCatalog,
};
use crate::core::engine::{EngineEvent, TransferEngine};
use crate::core::error::{NodeError, ProtocolError, SessionFailure, TransferError};
use crate::core::identity::{PeerIdentity, SessionId};
use crate::core::registry::{Route, SessionInfo, SessionRegistry, SessionSlot};
use crate::core::session::{
    Role, SessionAction, SessionEvent, SignalingSession, SignalingState, Termination,
};
use crate::signaling::bus::{BusEvent, SignalBus};
use crate::signaling::message::{SignalKind, SignalingMessage};
use crate::transport::{TransportEvent, TransportEventKind, TransportEvents, TransportFactory};

/// What became of one inbound relay event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Accepted,
    /// A redelivered offer, or a catalog that changes nothing.
    Ignored,
    Dropped(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    SessionStateChanged {
        peer: PeerIdentity,
        session: SessionId,
        state: SignalingState,
    },
    Connected {
        peer: PeerIdentity,
        session: SessionId,
    },
    SessionFailed {
        peer: PeerIdentity,
        session: SessionId,
        failure: SessionFailure,
    },
    CatalogUpdated {
        advertiser: PeerIdentity,
        entries: Vec<CatalogEntry>,
    },
    FileReceived {
        peer: PeerIdentity,
        session: SessionId,
        filename: String,
        data: Bytes,
    },
    TransferFailed {
        peer: PeerIdentity,
        session: SessionId,
        filename: String,
        error: TransferError,
    },
    MessageReceived {
        peer: PeerIdentity,
        session: SessionId,
        text: String,
    },
    ChannelClosed {
        peer: PeerIdentity,
        session: SessionId,
    },
}

type Reply<T> = oneshot::Sender<Result<T, NodeError>>;

pub enum NodeCommand {
    StartSession {
        peer: PeerIdentity,
        reply: Reply<SessionId>,
    },
    Advertise {
        catalog: Catalog,
        reply: Reply<()>,
    },
    RequestFile {
        peer: PeerIdentity,
        filename: String,
        reply: Reply<()>,
    },
    SendMessage {
        peer: PeerIdentity,
        text: String,
        reply: Reply<()>,
    },
    Close {
        peer: PeerIdentity,
        reply: Reply<()>,
    },
    RemoteCatalogs {
        reply: Reply<Vec<CatalogAnnouncement>>,
    },
    Sessions {
        reply: Reply<Vec<SessionInfo>>,
    },
    Shutdown,
}

/// Cloneable front door to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    local: PeerIdentity,
    commands: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    pub fn local_identity(&self) -> PeerIdentity {
        self.local
    }

    /// Open a session to `peer`. Returns once the offer has been published.
    pub async fn start_session(&self, peer: PeerIdentity) -> Result<SessionId, NodeError> {
        self.call(|reply| NodeCommand::StartSession { peer, reply })
            .await
    }

    /// Replace the local catalog and announce it.
    pub async fn advertise(&self, catalog: Catalog) -> Result<(), NodeError> {
        self.call(|reply| NodeCommand::Advertise { catalog, reply })
            .await
    }

    pub async fn request_file(
        &self,
        peer: PeerIdentity,
        filename: impl Into<String>,
    ) -> Result<(), NodeError> {
        let filename = filename.into();
        self.call(|reply| NodeCommand::RequestFile {
            peer,
            filename,
            reply,
        })
        .await
    }

    pub async fn send_message(
        &self,
        peer: PeerIdentity,
        text: impl Into<String>,
    ) -> Result<(), NodeError> {
        let text = text.into();
        self.call(|reply| NodeCommand::SendMessage { peer, text, reply })
            .await
    }

    /// Close every session and channel with `peer`.
    pub async fn close(&self, peer: PeerIdentity) -> Result<(), NodeError> {
        self.call(|reply| NodeCommand::Close { peer, reply }).await
    }

    pub async fn remote_catalogs(&self) -> Result<Vec<CatalogAnnouncement>, NodeError> {
        self.call(|reply| NodeCommand::RemoteCatalogs { reply })
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, NodeError> {
        self.call(|reply| NodeCommand::Sessions { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> NodeCommand,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }
}

pub struct Node {
    local: PeerIdentity,
    config: NodeConfig,
    registry: SessionRegistry,
    bus: Arc<dyn SignalBus>,
    factory: Arc<dyn TransportFactory>,
    catalog: SharedCatalog,
    remote_catalogs: RemoteCatalogs,
    commands: mpsc::Receiver<NodeCommand>,
    bus_events: mpsc::Receiver<BusEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Node {
    pub fn new(
        local: PeerIdentity,
        config: NodeConfig,
        bus: Arc<dyn SignalBus>,
        factory: Arc<dyn TransportFactory>,
        bus_events: mpsc::Receiver<BusEvent>,
    ) -> (Self, NodeHandle, mpsc::UnboundedReceiver<NodeEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.event_buffer);
        let (transport_tx, transport_rx) = mpsc::channel(config.event_buffer);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let node = Self {
            local,
            registry: SessionRegistry::new(local),
            bus,
            factory,
            catalog: Catalog::default().into_shared(),
            remote_catalogs: RemoteCatalogs::new(),
            commands: command_rx,
            bus_events,
            transport_tx,
            transport_rx,
            events: event_tx,
            config,
        };
        let handle = NodeHandle {
            local,
            commands: command_tx,
        };
        (node, handle, event_rx)
    }

    /// Run until `shutdown` is called or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        log::debug!("Node {} running", self.local.short());
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.bus_events.recv() => {
                    let outcome = self.handle_bus_event(event).await;
                    if let Dispatch::Dropped(reason) = outcome {
                        log::debug!("Dropped relay event: {}", reason);
                    }
                }
                Some(event) = self.transport_rx.recv() => {
                    self.handle_transport_event(event).await;
                }
                _ = housekeeping.tick() => {
                    self.housekeeping(Instant::now()).await;
                }
            }
        }

        self.shutdown_all().await;
        log::debug!("Node {} stopped", self.local.short());
        Ok(())
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::StartSession { peer, reply } => {
                let _ = reply.send(self.start_session(peer).await);
            }
            NodeCommand::Advertise { catalog, reply } => {
                let _ = reply.send(self.advertise(catalog).await);
            }
            NodeCommand::RequestFile {
                peer,
                filename,
                reply,
            } => {
                let result = match self.registry.engine_for_peer_mut(&peer) {
                    Some(engine) => engine.request_file(filename).await.map_err(NodeError::from),
                    None => Err(NodeError::Transfer(TransferError::ChannelNotReady)),
                };
                let _ = reply.send(result);
            }
            NodeCommand::SendMessage { peer, text, reply } => {
                let result = match self.registry.engine_for_peer_mut(&peer) {
                    Some(engine) => engine.send_message(text).await.map_err(NodeError::from),
                    None => Err(NodeError::Transfer(TransferError::ChannelNotReady)),
                };
                let _ = reply.send(result);
            }
            NodeCommand::Close { peer, reply } => {
                let _ = reply.send(self.close_peer(peer).await);
            }
            NodeCommand::RemoteCatalogs { reply } => {
                let _ = reply.send(Ok(self.remote_catalogs.snapshot()));
            }
            NodeCommand::Sessions { reply } => {
                let _ = reply.send(Ok(self.registry.snapshot()));
            }
            NodeCommand::Shutdown => {}
        }
    }

    /// Create an initiator session and publish its offer.
    pub async fn start_session(&mut self, peer: PeerIdentity) -> Result<SessionId, NodeError> {
        let session_id = SessionId::generate();
        let transport = self
            .factory
            .create(
                Role::Initiator,
                TransportEvents::new(session_id.clone(), self.transport_tx.clone()),
            )
            .await
            .map_err(|e| NodeError::Transport(format!("{:#}", e)))?;

        log::info!("Starting session {} with {}", session_id, peer.short());
        self.registry.insert_session(SessionSlot::new(
            SignalingSession::new(session_id.clone(), peer, Role::Initiator),
            transport,
            Instant::now() + self.config.handshake_timeout,
        ));

        match self.drive(&session_id, SessionEvent::Start).await {
            Some(SignalingState::Terminated(Termination::Failed(failure))) => {
                Err(NodeError::Publish(failure.to_string()))
            }
            _ => Ok(session_id),
        }
    }

    /// Replace the local catalog and announce it on the relay.
    pub async fn advertise(&mut self, catalog: Catalog) -> Result<(), NodeError> {
        let entries = catalog.entries();
        match self.catalog.write() {
            Ok(mut current) => *current = catalog,
            Err(poisoned) => *poisoned.into_inner() = catalog,
        }
        log::info!("Advertising {} file(s)", entries.len());
        self.bus
            .publish_catalog(&entries)
            .await
            .map_err(|e| NodeError::Publish(format!("{:#}", e)))
    }

    pub async fn handle_bus_event(&mut self, event: BusEvent) -> Dispatch {
        match event {
            BusEvent::Catalog(announcement) => self.handle_catalog(announcement),
            BusEvent::Signal(message) => self.handle_signal(message).await,
        }
    }

    fn handle_catalog(&mut self, announcement: CatalogAnnouncement) -> Dispatch {
        if announcement.advertiser == self.local {
            return Dispatch::Ignored;
        }
        let advertiser = announcement.advertiser;
        let entries = announcement.entries.clone();
        if self.remote_catalogs.apply(announcement) {
            log::debug!(
                "Catalog of {} now has {} file(s)",
                advertiser.short(),
                entries.len()
            );
            self.emit(NodeEvent::CatalogUpdated {
                advertiser,
                entries,
            });
            Dispatch::Accepted
        } else {
            Dispatch::Ignored
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) -> Dispatch {
        let route = match self.registry.route(&message) {
            Ok(route) => route,
            Err(reason) => return Dispatch::Dropped(reason),
        };
        if route == Route::Duplicate {
            log::debug!("Ignoring duplicate offer for session {}", message.session_id);
            return Dispatch::Ignored;
        }

        // Decode before anything changes so a malformed message leaves the
        // session where it was
        let descriptor = match message.descriptor() {
            Ok(descriptor) => descriptor,
            Err(reason) => {
                log::warn!(
                    "Malformed {:?} from {}: {}",
                    message.kind,
                    message.sender.short(),
                    reason
                );
                return Dispatch::Dropped(reason);
            }
        };

        let session_id = message.session_id.clone();
        let event = match message.kind {
            SignalKind::Offer => {
                if let Err(e) = self.accept_session(&message).await {
                    log::warn!(
                        "Failed to set up session {} from {}: {:#}",
                        session_id,
                        message.sender.short(),
                        e
                    );
                    self.emit(NodeEvent::SessionFailed {
                        peer: message.sender,
                        session: session_id.clone(),
                        failure: SessionFailure::Transport(format!("{:#}", e)),
                    });
                    return Dispatch::Accepted;
                }
                SessionEvent::OfferReceived {
                    descriptor,
                    offer_id: message.id.clone(),
                }
            }
            SignalKind::Answer => SessionEvent::AnswerReceived { descriptor },
            SignalKind::IceCandidate => SessionEvent::RemoteCandidate(descriptor),
        };

        self.drive(&session_id, event).await;
        Dispatch::Accepted
    }

    async fn accept_session(&mut self, offer: &SignalingMessage) -> Result<()> {
        let transport = self
            .factory
            .create(
                Role::Responder,
                TransportEvents::new(offer.session_id.clone(), self.transport_tx.clone()),
            )
            .await
            .context("Failed to create transport")?;

        log::info!(
            "Incoming session {} from {}",
            offer.session_id,
            offer.sender.short()
        );
        self.registry.insert_session(SessionSlot::new(
            SignalingSession::new(offer.session_id.clone(), offer.sender, Role::Responder),
            transport,
            Instant::now() + self.config.handshake_timeout,
        ));
        Ok(())
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent { session, kind } = event;

        if self.registry.session(&session).is_some() {
            let session_event = match kind {
                TransportEventKind::LocalCandidate(candidate) => {
                    SessionEvent::LocalCandidate(candidate)
                }
                TransportEventKind::ChannelOpen => SessionEvent::ChannelOpen,
                TransportEventKind::Failed(reason) => SessionEvent::TransportFailed(reason),
                TransportEventKind::Closed => SessionEvent::Close,
                TransportEventKind::Frame(_) => {
                    log::debug!("Dropping frame for session {} before hand-off", session);
                    return;
                }
            };
            self.drive(&session, session_event).await;
            return;
        }

        let Some(engine) = self.registry.engine_mut(&session) else {
            log::debug!("Transport event for unknown session {}: {:?}", session, kind);
            return;
        };
        let peer = engine.peer();

        match kind {
            TransportEventKind::Frame(frame) => {
                let events = engine.handle_frame(frame).await;
                self.emit_engine_events(peer, &session, events);
            }
            TransportEventKind::Closed | TransportEventKind::Failed(_) => {
                self.close_engine(&session).await;
            }
            TransportEventKind::LocalCandidate(_) | TransportEventKind::ChannelOpen => {}
        }
    }

    /// Timer tick: handshake timeouts, transfer timeouts, cleanup.
    pub async fn housekeeping(&mut self, now: Instant) {
        for session_id in self.registry.expired_sessions(now) {
            let after = self.config.handshake_timeout;
            self.drive(&session_id, SessionEvent::HandshakeTimeout(after))
                .await;
        }

        for session_id in self.registry.engine_ids() {
            let Some(engine) = self.registry.engine_mut(&session_id) else {
                continue;
            };
            let peer = engine.peer();
            if !engine.is_open() {
                self.close_engine(&session_id).await;
                continue;
            }
            let events = engine.poll_timeout(now).await;
            self.emit_engine_events(peer, &session_id, events);
        }

        for session_id in self.registry.finished_sessions() {
            self.registry.remove_session(&session_id);
        }
    }

    /// Feed an event to a session and carry out the resulting actions.
    /// Returns the state the session ended up in.
    async fn drive(
        &mut self,
        session_id: &SessionId,
        event: SessionEvent,
    ) -> Option<SignalingState> {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let Some(slot) = self.registry.session_mut(session_id) else {
                return None;
            };
            let before = slot.session.state().clone();
            let actions = slot.session.handle(event);
            let after = slot.session.state().clone();
            let peer = slot.session.peer();

            if before != after {
                log::debug!("Session {}: {} -> {}", session_id, before, after);
                self.emit(NodeEvent::SessionStateChanged {
                    peer,
                    session: session_id.clone(),
                    state: after.clone(),
                });
                if let SignalingState::Terminated(Termination::Failed(failure)) = &after {
                    log::warn!(
                        "Session {} with {} failed: {}",
                        session_id,
                        peer.short(),
                        failure
                    );
                    self.emit(NodeEvent::SessionFailed {
                        peer,
                        session: session_id.clone(),
                        failure: failure.clone(),
                    });
                }
            }

            for action in actions {
                match self.execute(session_id, peer, action).await {
                    Ok(Some(follow_up)) => pending.push_back(follow_up),
                    Ok(None) => {}
                    Err(e) => {
                        pending.clear();
                        pending.push_back(SessionEvent::TransportFailed(format!("{:#}", e)));
                        break;
                    }
                }
            }
        }

        let state = self
            .registry
            .session(session_id)
            .map(|slot| slot.session.state().clone())?;
        if !state.is_handshaking() {
            self.registry.remove_session(session_id);
        }
        Some(state)
    }

    async fn execute(
        &mut self,
        session_id: &SessionId,
        peer: PeerIdentity,
        action: SessionAction,
    ) -> Result<Option<SessionEvent>> {
        let transport = self
            .registry
            .session(session_id)
            .and_then(|slot| slot.transport.clone());

        match action {
            SessionAction::CreateOffer => {
                let transport = transport.context("Session has no transport")?;
                let sdp = transport.create_offer().await?;
                let offer = SignalingMessage::offer(self.local, peer, session_id.clone(), &sdp);
                self.bus
                    .publish_signal(&offer)
                    .await
                    .context("Failed to publish offer")?;
                Ok(None)
            }
            SessionAction::AcceptOffer { descriptor, ref_id } => {
                let transport = transport.context("Session has no transport")?;
                let sdp = transport.accept_offer(&descriptor).await?;
                let answer =
                    SignalingMessage::answer(self.local, peer, session_id.clone(), ref_id, &sdp);
                self.bus
                    .publish_signal(&answer)
                    .await
                    .context("Failed to publish answer")?;
                Ok(Some(SessionEvent::AnswerPublished))
            }
            SessionAction::ApplyAnswer { descriptor } => {
                let transport = transport.context("Session has no transport")?;
                transport.apply_answer(&descriptor).await?;
                Ok(None)
            }
            SessionAction::AddCandidates(candidates) => {
                let transport = transport.context("Session has no transport")?;
                for candidate in candidates {
                    if let Err(e) = transport.add_ice_candidate(&candidate).await {
                        log::warn!("Failed to add ICE candidate for {}: {:#}", session_id, e);
                    }
                }
                Ok(None)
            }
            SessionAction::PublishCandidate(candidate) => {
                let message =
                    SignalingMessage::ice_candidate(self.local, peer, session_id.clone(), &candidate);
                if let Err(e) = self.bus.publish_signal(&message).await {
                    log::warn!("Failed to publish ICE candidate for {}: {:#}", session_id, e);
                }
                Ok(None)
            }
            SessionAction::HandOff => {
                let transport = self
                    .registry
                    .session_mut(session_id)
                    .and_then(|slot| slot.transport.take())
                    .context("Session has no transport")?;
                let channel = transport
                    .take_channel()
                    .context("Transport reported an open channel but has none")?;
                let role = self
                    .registry
                    .session(session_id)
                    .map(|slot| slot.session.role())
                    .unwrap_or(Role::Initiator);

                self.registry.insert_engine(TransferEngine::new(
                    peer,
                    session_id.clone(),
                    role,
                    channel,
                    self.catalog.clone(),
                    &self.config,
                ));
                log::info!("Connected to {} (session {})", peer.short(), session_id);
                self.emit(NodeEvent::Connected {
                    peer,
                    session: session_id.clone(),
                });
                Ok(None)
            }
            SessionAction::Release => {
                if let Some(transport) = self
                    .registry
                    .session_mut(session_id)
                    .and_then(|slot| slot.transport.take())
                {
                    transport.close().await;
                }
                Ok(None)
            }
        }
    }

    async fn close_peer(&mut self, peer: PeerIdentity) -> Result<(), NodeError> {
        let sessions = self.registry.sessions_with(&peer);
        let engines = self.registry.engines_with(&peer);
        if sessions.is_empty() && engines.is_empty() {
            return Err(NodeError::NoSession(peer.to_string()));
        }

        for session_id in sessions {
            self.drive(&session_id, SessionEvent::Close).await;
        }
        for session_id in engines {
            self.close_engine(&session_id).await;
        }
        Ok(())
    }

    async fn close_engine(&mut self, session_id: &SessionId) {
        let Some(mut engine) = self.registry.remove_engine(session_id) else {
            return;
        };
        let peer = engine.peer();
        let events = engine.close().await;
        self.emit_engine_events(peer, session_id, events);
        log::info!("Channel to {} closed (session {})", peer.short(), session_id);
        self.emit(NodeEvent::ChannelClosed {
            peer,
            session: session_id.clone(),
        });
    }

    async fn shutdown_all(&mut self) {
        for session_id in self.registry.finished_sessions() {
            self.registry.remove_session(&session_id);
        }
        let sessions: Vec<SessionId> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|info| info.state != SignalingState::Connected)
            .map(|info| info.session_id)
            .collect();
        for session_id in sessions {
            self.drive(&session_id, SessionEvent::Close).await;
        }
        for session_id in self.registry.engine_ids() {
            self.close_engine(&session_id).await;
        }
    }

    pub fn session_state(&self, session_id: &SessionId) -> Option<SignalingState> {
        if let Some(slot) = self.registry.session(session_id) {
            return Some(slot.session.state().clone());
        }
        self.registry
            .snapshot()
            .into_iter()
            .find(|info| &info.session_id == session_id)
            .map(|info| info.state)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    fn emit_engine_events(
        &self,
        peer: PeerIdentity,
        session: &SessionId,
        events: Vec<EngineEvent>,
    ) {
        for event in events {
            let event = match event {
                EngineEvent::FileReceived { filename, data } => NodeEvent::FileReceived {
                    peer,
                    session: session.clone(),
                    filename,
                    data,
                },
                EngineEvent::TransferFailed { filename, error } => {
                    log::warn!("Transfer of '{}' from {} failed: {}", filename, peer.short(), error);
                    NodeEvent::TransferFailed {
                        peer,
                        session: session.clone(),
                        filename,
                        error,
                    }
                }
                EngineEvent::MessageReceived { text } => NodeEvent::MessageReceived {
                    peer,
                    session: session.clone(),
                    text,
                },
            };
            self.emit(event);
        }
    }

    fn emit(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            log::trace!("No listener for node events");
        }
    }
}
