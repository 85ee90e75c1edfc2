//! WebRTC peer connection driven by a signaling session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use peerlink_common::core::session::Role;
use peerlink_common::transport::{
    ChannelTransport, PeerTransport, TransportEvents, TransportFactory,
};

use super::channel::WebRtcChannel;

/// Google STUN server for NAT traversal
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the one data channel each session opens
const DATA_CHANNEL_LABEL: &str = "peerlink";

type ChannelSlot = Arc<Mutex<Option<Arc<WebRtcChannel>>>>;

/// WebRTC peer connection wrapper
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    events: TransportEvents,
    channel: ChannelSlot,
    taken: AtomicBool,
}

impl WebRtcPeer {
    /// Create a peer connection using the given STUN/TURN urls. With no urls
    /// only host candidates are gathered.
    pub async fn new(role: Role, ice_urls: &[String], events: TransportEvents) -> Result<Self> {
        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );
        let channel: ChannelSlot = Arc::new(Mutex::new(None));

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = ice_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let json = candidate
                    .to_json()
                    .map_err(anyhow::Error::from)
                    .and_then(|init| serde_json::to_string(&init).map_err(anyhow::Error::from));
                match json {
                    Ok(json) => {
                        events.local_candidate(json).await;
                    }
                    Err(e) => log::warn!("Failed to encode ICE candidate: {:#}", e),
                }
            })
        }));

        let session = events.session().clone();
        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let session = session.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        log::info!("WebRTC connection established (session {})", session);
                    }
                    RTCPeerConnectionState::Disconnected => {
                        log::info!("WebRTC connection disconnected (session {})", session);
                    }
                    RTCPeerConnectionState::Failed => {
                        log::error!("WebRTC connection failed (session {})", session);
                        events.failed("peer connection failed").await;
                    }
                    _ => {}
                }
            })
        }));

        if role == Role::Responder {
            let dc_events = events.clone();
            let dc_slot = channel.clone();
            let dc_connection = Arc::downgrade(&peer_connection);
            peer_connection.on_data_channel(Box::new(move |dc| {
                let events = dc_events.clone();
                let slot = dc_slot.clone();
                let connection = dc_connection.clone();
                Box::pin(async move {
                    let Some(connection) = connection.upgrade() else {
                        return;
                    };
                    log::debug!("Remote opened data channel '{}'", dc.label());
                    store_channel(&slot, WebRtcChannel::attach(dc, connection, events));
                })
            }));
        }

        Ok(Self {
            peer_connection,
            events,
            channel,
            taken: AtomicBool::new(false),
        })
    }
}

fn store_channel(slot: &ChannelSlot, channel: Arc<WebRtcChannel>) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(channel),
        Err(poisoned) => *poisoned.into_inner() = Some(channel),
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let dc = self
            .peer_connection
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .context("Failed to create data channel")?;
        store_channel(
            &self.channel,
            WebRtcChannel::attach(dc, self.peer_connection.clone(), self.events.clone()),
        );

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .context("Invalid SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .context("Invalid SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit =
            serde_json::from_str(candidate).context("Invalid ICE candidate JSON")?;
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    fn take_channel(&self) -> Option<Arc<dyn ChannelTransport>> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let channel: Arc<dyn ChannelTransport> = match self.channel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }?;
        Some(channel)
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            log::debug!("Failed to close peer connection: {}", e);
        }
    }
}

/// Creates one WebRTC peer connection per session.
pub struct WebRtcFactory {
    ice_urls: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_urls: Vec<String>) -> Self {
        Self { ice_urls }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, role: Role, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let peer = WebRtcPeer::new(role, &self.ice_urls, events).await?;
        Ok(Arc::new(peer))
    }
}
