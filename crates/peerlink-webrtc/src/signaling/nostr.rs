//! Nostr relay adapter for the node's signal bus.
//!
//! Signaling events (kinds 5010-5012) are addressed with a `p` tag, so the
//! subscription only asks relays for events tagged with our public key.
//! Catalog announcements (kind 10020) are subscribed to without a filter on
//! the author: every peer on the relay is listed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use peerlink_common::core::catalog::CatalogEntry;
use peerlink_common::core::identity::PeerIdentity;
use peerlink_common::signaling::bus::{BusEvent, SignalBus};
use peerlink_common::signaling::message::{SignalKind, SignalingMessage};
use peerlink_common::signaling::nostr_protocol::{
    catalog_event_kind, catalog_to_event, event_to_bus_event, signal_event_kind, signal_to_event,
};

/// Timeout for relay connections
const RELAY_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Helper to setup client with relays and connect
///
/// Creates a Nostr client, adds the specified relays, connects, and waits
/// for at least one relay to successfully connect. Returns an error if
/// no relays could be added or connected.
async fn setup_client_with_relays(keys: &Keys, relay_urls: &[String]) -> Result<Client> {
    let client = Client::new(keys.clone());

    let mut added_relays = 0usize;
    for relay_url in relay_urls {
        match client.add_relay(relay_url).await {
            Ok(_) => {
                added_relays += 1;
            }
            Err(e) => {
                log::error!("Failed to add relay {}: {}", relay_url, e);
            }
        }
    }
    if added_relays == 0 {
        anyhow::bail!("Failed to add any Nostr relays; cannot continue without relays.");
    }

    client.connect().await;
    client.wait_for_connection(RELAY_CONNECTION_TIMEOUT).await;

    let relay_statuses = client.relays().await;
    let connected_count = relay_statuses.values().filter(|r| r.is_connected()).count();

    if connected_count == 0 {
        anyhow::bail!(
            "Failed to connect to any Nostr relay within timeout. \
             Check network connectivity and relay availability."
        );
    }

    log::debug!(
        "Connected to {}/{} Nostr relays",
        connected_count,
        relay_statuses.len()
    );

    Ok(client)
}

/// Relay connection shared by the node (publishing) and the receiver task.
pub struct NostrSignalBus {
    client: Client,
    keys: Keys,
    relay_urls: Vec<String>,
}

impl NostrSignalBus {
    pub async fn connect(keys: Keys, relay_urls: Vec<String>) -> Result<Self> {
        let client = setup_client_with_relays(&keys, &relay_urls).await?;
        Ok(Self {
            client,
            keys,
            relay_urls,
        })
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::from(self.keys.public_key())
    }

    pub fn relay_urls(&self) -> &[String] {
        &self.relay_urls
    }

    /// Subscribe to signaling addressed to us and to every catalog.
    pub async fn subscribe(&self) -> Result<()> {
        let signals = Filter::new()
            .kinds([
                signal_event_kind(SignalKind::Offer),
                signal_event_kind(SignalKind::Answer),
                signal_event_kind(SignalKind::IceCandidate),
            ])
            .custom_tag(
                SingleLetterTag::lowercase(Alphabet::P),
                self.keys.public_key().to_hex(),
            )
            .since(Timestamp::now());

        self.client
            .subscribe(signals, None)
            .await
            .context("Failed to subscribe to signaling events")?;

        let catalogs = Filter::new().kind(catalog_event_kind());
        self.client
            .subscribe(catalogs, None)
            .await
            .context("Failed to subscribe to catalog announcements")?;

        Ok(())
    }

    /// Forward verified relay events to the node until it goes away.
    pub fn start_event_receiver(&self, tx: mpsc::Sender<BusEvent>) -> JoinHandle<()> {
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut notifications = client.notifications();

            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event { event, .. }) => {
                        if !forward_event(&event, &tx).await {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!(
                            "Nostr relay notification stream error, stopping receiver: {}",
                            e
                        );
                        break;
                    }
                }
            }
        })
    }

    /// Disconnect from relays
    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

/// Decode one relay event and hand it to the node. Returns `false` once the
/// node has stopped listening.
async fn forward_event(event: &Event, tx: &mpsc::Sender<BusEvent>) -> bool {
    match event_to_bus_event(event) {
        Ok(bus_event) => {
            if tx.send(bus_event).await.is_err() {
                log::debug!("Bus receiver closed, stopping relay listener");
                return false;
            }
        }
        Err(e) => {
            log::debug!("Dropping relay event {}: {}", event.id.to_hex(), e);
        }
    }
    true
}

#[async_trait]
impl SignalBus for NostrSignalBus {
    async fn publish_signal(&self, message: &SignalingMessage) -> Result<()> {
        let event = signal_to_event(&self.keys, message)?;
        self.client
            .send_event(&event)
            .await
            .with_context(|| format!("Failed to publish {:?}", message.kind))?;
        Ok(())
    }

    async fn publish_catalog(&self, entries: &[CatalogEntry]) -> Result<()> {
        let event = catalog_to_event(&self.keys, entries)?;
        self.client
            .send_event(&event)
            .await
            .context("Failed to publish catalog")?;
        Ok(())
    }
}
