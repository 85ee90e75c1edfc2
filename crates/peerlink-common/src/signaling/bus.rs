//! Relay abstraction used by the node.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::catalog::{CatalogAnnouncement, CatalogEntry};
use crate::signaling::message::SignalingMessage;

/// Everything the node can receive from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Signal(SignalingMessage),
    Catalog(CatalogAnnouncement),
}

/// Publish side of the relay. Inbound traffic reaches the node as
/// [`BusEvent`]s on an mpsc channel.
///
/// Delivery is best effort: messages may be lost, duplicated or reordered,
/// and the node tolerates all three.
#[async_trait]
pub trait SignalBus: Send + Sync {
    async fn publish_signal(&self, message: &SignalingMessage) -> Result<()>;

    /// Announce the full local catalog, replacing any earlier announcement.
    async fn publish_catalog(&self, entries: &[CatalogEntry]) -> Result<()>;
}
