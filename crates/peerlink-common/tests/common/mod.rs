//! In-memory relay and peer connections for driving real nodes in tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peerlink_common::config::NodeConfig;
use peerlink_common::core::catalog::{CatalogAnnouncement, CatalogEntry};
use peerlink_common::core::identity::{PeerIdentity, SessionId};
use peerlink_common::core::node::{Node, NodeEvent, NodeHandle};
use peerlink_common::core::session::Role;
use peerlink_common::signaling::bus::{BusEvent, SignalBus};
use peerlink_common::signaling::message::{SignalKind, SignalingMessage};
use peerlink_common::transport::{
    ChannelTransport, Frame, PeerTransport, TransportEvents, TransportFactory,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn identity(n: u8) -> PeerIdentity {
    PeerIdentity::from_bytes([n; 32])
}

// =============================================================================
// Relay
// =============================================================================

/// Broadcasts every published event to every subscriber, in publish order.
#[derive(Default)]
pub struct MemoryRelay {
    subscribers: Mutex<Vec<mpsc::Sender<BusEvent>>>,
    published: Mutex<Vec<BusEvent>>,
    held_kinds: Mutex<HashSet<SignalKind>>,
    held: Mutex<Vec<BusEvent>>,
    next_id: AtomicU64,
    clock: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn bus(self: &Arc<Self>, identity: PeerIdentity) -> Arc<MemoryBus> {
        Arc::new(MemoryBus {
            relay: self.clone(),
            identity,
        })
    }

    /// Keep signals of this kind from being delivered until released.
    pub fn hold(&self, kind: SignalKind) {
        self.held_kinds.lock().unwrap().insert(kind);
    }

    pub fn release(&self, kind: SignalKind) {
        self.held_kinds.lock().unwrap().remove(&kind);
        let released: Vec<BusEvent> = {
            let mut held = self.held.lock().unwrap();
            let (matching, rest): (Vec<_>, Vec<_>) = held
                .drain(..)
                .partition(|event| signal_kind(event) == Some(kind));
            *held = rest;
            matching
        };
        for event in released {
            self.broadcast(event);
        }
    }

    /// Deliver every published signal of this kind once more.
    pub fn redeliver(&self, kind: SignalKind) {
        let again: Vec<BusEvent> = self
            .published()
            .into_iter()
            .filter(|event| signal_kind(event) == Some(kind))
            .collect();
        for event in again {
            self.broadcast(event);
        }
    }

    pub fn inject(&self, event: BusEvent) {
        self.broadcast(event);
    }

    pub fn published(&self) -> Vec<BusEvent> {
        self.published.lock().unwrap().clone()
    }

    pub fn signals(&self, kind: SignalKind) -> Vec<SignalingMessage> {
        self.published()
            .into_iter()
            .filter_map(|event| match event {
                BusEvent::Signal(message) if message.kind == kind => Some(message),
                _ => None,
            })
            .collect()
    }

    fn publish(&self, event: BusEvent) {
        self.published.lock().unwrap().push(event.clone());
        if let Some(kind) = signal_kind(&event) {
            if self.held_kinds.lock().unwrap().contains(&kind) {
                self.held.lock().unwrap().push(event);
                return;
            }
        }
        self.broadcast(event);
    }

    fn broadcast(&self, event: BusEvent) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.try_send(event.clone());
        }
    }
}

fn signal_kind(event: &BusEvent) -> Option<SignalKind> {
    match event {
        BusEvent::Signal(message) => Some(message.kind),
        BusEvent::Catalog(_) => None,
    }
}

pub struct MemoryBus {
    relay: Arc<MemoryRelay>,
    identity: PeerIdentity,
}

#[async_trait]
impl SignalBus for MemoryBus {
    async fn publish_signal(&self, message: &SignalingMessage) -> Result<()> {
        let mut message = message.clone();
        let id = self.relay.next_id.fetch_add(1, Ordering::SeqCst);
        message.id = Some(format!("evt-{}", id));
        self.relay.publish(BusEvent::Signal(message));
        Ok(())
    }

    async fn publish_catalog(&self, entries: &[CatalogEntry]) -> Result<()> {
        let created_at = self.relay.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let id = self.relay.next_id.fetch_add(1, Ordering::SeqCst);
        self.relay.publish(BusEvent::Catalog(CatalogAnnouncement {
            advertiser: self.identity,
            event_id: format!("evt-{}", id),
            created_at,
            entries: entries.to_vec(),
        }));
        Ok(())
    }
}

// =============================================================================
// Peer connections
// =============================================================================

#[derive(Default)]
struct Endpoint {
    events: Option<TransportEvents>,
    remote_bound: bool,
    saw_candidate: bool,
    channel: Option<Arc<MemoryChannel>>,
    taken: bool,
}

/// Pairs the two ends of a session by session id. The data channel opens
/// once both ends have bound the remote description and each has received
/// at least one remote candidate.
#[derive(Default)]
pub struct FakeNetwork {
    endpoints: Mutex<HashMap<(SessionId, Role), Endpoint>>,
    opened: Mutex<HashSet<SessionId>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<FakeFactory> {
        Arc::new(FakeFactory {
            network: self.clone(),
        })
    }

    /// Frames sent by one end of a session.
    pub fn sent_frames(&self, session: &SessionId, role: Role) -> Vec<Frame> {
        self.endpoints
            .lock()
            .unwrap()
            .get(&(session.clone(), role))
            .and_then(|endpoint| endpoint.channel.as_ref())
            .map(|channel| channel.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self, session: &SessionId) -> bool {
        self.opened.lock().unwrap().contains(session)
    }

    fn update(&self, session: &SessionId, role: Role, f: impl FnOnce(&mut Endpoint)) {
        let mut endpoints = self.endpoints.lock().unwrap();
        f(endpoints.entry((session.clone(), role)).or_default());
    }

    /// Open the channel if both ends are ready. Returns the events of both
    /// ends to notify.
    fn try_open(&self, session: &SessionId) -> Vec<TransportEvents> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let ready = [Role::Initiator, Role::Responder].iter().all(|role| {
            endpoints
                .get(&(session.clone(), *role))
                .map(|e| e.events.is_some() && e.remote_bound && e.saw_candidate)
                .unwrap_or(false)
        });
        if !ready || !self.opened.lock().unwrap().insert(session.clone()) {
            return Vec::new();
        }

        let open = Arc::new(AtomicBool::new(true));
        let initiator_events = endpoints[&(session.clone(), Role::Initiator)]
            .events
            .clone();
        let responder_events = endpoints[&(session.clone(), Role::Responder)]
            .events
            .clone();
        let (Some(initiator_events), Some(responder_events)) = (initiator_events, responder_events)
        else {
            return Vec::new();
        };

        if let Some(endpoint) = endpoints.get_mut(&(session.clone(), Role::Initiator)) {
            endpoint.channel = Some(Arc::new(MemoryChannel::new(
                open.clone(),
                responder_events.clone(),
            )));
        }
        if let Some(endpoint) = endpoints.get_mut(&(session.clone(), Role::Responder)) {
            endpoint.channel = Some(Arc::new(MemoryChannel::new(
                open,
                initiator_events.clone(),
            )));
        }
        vec![initiator_events, responder_events]
    }
}

pub struct FakeFactory {
    network: Arc<FakeNetwork>,
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, role: Role, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let session = events.session().clone();
        self.network
            .update(&session, role, |endpoint| endpoint.events = Some(events.clone()));
        Ok(Arc::new(FakePeer {
            network: self.network.clone(),
            session,
            role,
            events,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakePeer {
    network: Arc<FakeNetwork>,
    session: SessionId,
    role: Role,
    events: TransportEvents,
    closed: AtomicBool,
}

impl FakePeer {
    fn candidate(&self) -> String {
        format!(
            r#"{{"candidate":"candidate:1 1 udp 1 127.0.0.1 9 typ host {}","sdpMid":"0","sdpMLineIndex":0}}"#,
            self.role
        )
    }

    async fn open_if_ready(&self) {
        for events in self.network.try_open(&self.session) {
            events.channel_open().await;
        }
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn create_offer(&self) -> Result<String> {
        self.events.local_candidate(self.candidate()).await;
        Ok(format!("fake-offer {}", self.session))
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String> {
        if !offer_sdp.starts_with("fake-offer") {
            bail!("Not an offer: {}", offer_sdp);
        }
        self.network
            .update(&self.session, self.role, |e| e.remote_bound = true);
        self.events.local_candidate(self.candidate()).await;
        Ok(format!("fake-answer {}", self.session))
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<()> {
        if !answer_sdp.starts_with("fake-answer") {
            bail!("Not an answer: {}", answer_sdp);
        }
        self.network
            .update(&self.session, self.role, |e| e.remote_bound = true);
        self.open_if_ready().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(candidate)?;
        self.network
            .update(&self.session, self.role, |e| e.saw_candidate = true);
        self.open_if_ready().await;
        Ok(())
    }

    fn take_channel(&self) -> Option<Arc<dyn ChannelTransport>> {
        let mut endpoints = self.network.endpoints.lock().unwrap();
        let endpoint = endpoints.get_mut(&(self.session.clone(), self.role))?;
        if endpoint.taken {
            return None;
        }
        endpoint.taken = true;
        let channel: Arc<dyn ChannelTransport> = endpoint.channel.clone()?;
        Some(channel)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One end of an in-memory data channel. Frames go straight to the other
/// end's transport events.
pub struct MemoryChannel {
    open: Arc<AtomicBool>,
    remote: TransportEvents,
    sent: Mutex<Vec<Frame>>,
}

impl MemoryChannel {
    fn new(open: Arc<AtomicBool>, remote: TransportEvents) -> Self {
        Self {
            open,
            remote,
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChannelTransport for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            bail!("Channel closed");
        }
        self.sent.lock().unwrap().push(frame.clone());
        if !self.remote.frame(frame).await {
            bail!("Remote end gone");
        }
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.remote.closed().await;
        }
    }
}

// =============================================================================
// Nodes
// =============================================================================

pub struct TestNode {
    pub identity: PeerIdentity,
    pub handle: NodeHandle,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    pub task: JoinHandle<Result<()>>,
}

impl TestNode {
    /// Wait for the first event matching `predicate`, skipping others.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        let result = tokio::time::timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;

        match result {
            Ok(Some(event)) => event,
            Ok(None) => panic!("node {} stopped while waiting", self.identity.short()),
            Err(_) => panic!("timed out waiting on node {}", self.identity.short()),
        }
    }

    pub async fn wait_connected(&mut self, peer: PeerIdentity) -> SessionId {
        match self
            .wait_for(|event| matches!(event, NodeEvent::Connected { peer: p, .. } if *p == peer))
            .await
        {
            NodeEvent::Connected { session, .. } => session,
            _ => unreachable!(),
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown().await;
        self.task.await.unwrap().unwrap();
    }
}

pub fn spawn_node(
    relay: &Arc<MemoryRelay>,
    network: &Arc<FakeNetwork>,
    identity: PeerIdentity,
    config: NodeConfig,
) -> TestNode {
    let (node, handle, events) = Node::new(
        identity,
        config,
        relay.bus(identity),
        network.factory(),
        relay.subscribe(),
    );
    TestNode {
        identity,
        handle,
        events,
        task: tokio::spawn(node.run()),
    }
}

/// Two running nodes with an open channel between them.
pub async fn connected_pair(
    relay: &Arc<MemoryRelay>,
    network: &Arc<FakeNetwork>,
    config: NodeConfig,
) -> (TestNode, TestNode, SessionId) {
    let mut alice = spawn_node(relay, network, identity(1), config.clone());
    let mut bob = spawn_node(relay, network, identity(2), config);

    let session = alice.handle.start_session(bob.identity).await.unwrap();
    assert_eq!(alice.wait_connected(bob.identity).await, session);
    assert_eq!(bob.wait_connected(alice.identity).await, session);
    (alice, bob, session)
}
