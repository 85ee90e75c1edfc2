//! Mapping between peerlink messages and signed Nostr events.
//!
//! Signaling events carry everything in tags and leave the content empty:
//!
//! | tag         | value                                          |
//! |-------------|------------------------------------------------|
//! | `p`         | recipient public key (hex)                     |
//! | `session`   | session id                                     |
//! | `ref`       | offer event id (answer) or session id (ICE)    |
//! | `sdp`       | base64 SDP (offer, answer)                     |
//! | `candidate` | base64 candidate JSON (ICE)                    |
//!
//! Catalog announcements (kind 10020) carry one `["file", name, metadata]`
//! tag per shared file.

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;

use crate::core::catalog::{CatalogAnnouncement, CatalogEntry};
use crate::core::error::ProtocolError;
use crate::core::identity::{PeerIdentity, SessionId};
use crate::signaling::bus::BusEvent;
use crate::signaling::message::{SignalKind, SignalingMessage, KIND_CATALOG};

/// Relays used when none are given on the command line.
pub const DEFAULT_NOSTR_RELAYS: &[&str] = &[
    "wss://relay.primal.net",
    "wss://relay.damus.io",
    "wss://nos.lol",
];

/// Tag names used by signaling and catalog events
pub const TAG_PUBKEY: &str = "p";
pub const TAG_SESSION: &str = "session";
pub const TAG_REF: &str = "ref";
pub const TAG_SDP: &str = "sdp";
pub const TAG_CANDIDATE: &str = "candidate";
pub const TAG_FILE: &str = "file";

pub fn signal_event_kind(kind: SignalKind) -> Kind {
    Kind::from_u16(kind.as_u16())
}

/// Replaceable event kind for catalog announcements (10000-19999 range)
/// Relays keep only the newest one per author
pub fn catalog_event_kind() -> Kind {
    Kind::from_u16(KIND_CATALOG)
}

fn payload_tag(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::Offer | SignalKind::Answer => TAG_SDP,
        SignalKind::IceCandidate => TAG_CANDIDATE,
    }
}

fn custom_tag(name: &'static str, values: Vec<String>) -> Tag {
    Tag::custom(TagKind::Custom(name.into()), values)
}

/// Build and sign the event for a signaling message.
///
/// The event author is always the owner of `keys`; `message.sender` is not
/// consulted.
pub fn signal_to_event(keys: &Keys, message: &SignalingMessage) -> Result<Event> {
    let mut tags = vec![
        Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::P)),
            vec![message.recipient.to_hex()],
        ),
        custom_tag(TAG_SESSION, vec![message.session_id.to_string()]),
    ];
    if let Some(ref_id) = &message.ref_id {
        tags.push(custom_tag(TAG_REF, vec![ref_id.clone()]));
    }
    tags.push(custom_tag(
        payload_tag(message.kind),
        vec![message.payload.clone()],
    ));

    let event = EventBuilder::new(signal_event_kind(message.kind), "")
        .tags(tags)
        .sign_with_keys(keys)
        .context("Failed to sign signaling event")?;

    Ok(event)
}

/// Build and sign a catalog announcement.
pub fn catalog_to_event(keys: &Keys, entries: &[CatalogEntry]) -> Result<Event> {
    let tags = entries
        .iter()
        .map(|e| custom_tag(TAG_FILE, vec![e.name.clone(), e.metadata.clone()]));

    let event = EventBuilder::new(catalog_event_kind(), "")
        .tags(tags)
        .sign_with_keys(keys)
        .context("Failed to sign catalog event")?;

    Ok(event)
}

/// Verify and decode a relay event.
///
/// Recipient filtering is not done here; the registry drops messages
/// addressed to other identities.
pub fn event_to_bus_event(event: &Event) -> Result<BusEvent, ProtocolError> {
    event.verify().map_err(|_| ProtocolError::BadSignature)?;

    let kind = event.kind.as_u16();
    if kind == KIND_CATALOG {
        return Ok(BusEvent::Catalog(parse_catalog(event)));
    }

    let signal_kind = SignalKind::from_u16(kind).ok_or(ProtocolError::UnknownKind(kind))?;

    let recipient: PeerIdentity = tag_value(event, TAG_PUBKEY)
        .ok_or(ProtocolError::MissingTag(TAG_PUBKEY))?
        .parse()?;
    let session_id = tag_value(event, TAG_SESSION)
        .filter(|s| !s.is_empty())
        .ok_or(ProtocolError::MissingTag(TAG_SESSION))?;
    let payload_name = payload_tag(signal_kind);
    let payload = tag_value(event, payload_name).ok_or(ProtocolError::MissingTag(payload_name))?;

    Ok(BusEvent::Signal(SignalingMessage {
        id: Some(event.id.to_hex()),
        kind: signal_kind,
        sender: PeerIdentity::from(&event.pubkey),
        recipient,
        session_id: SessionId::new(session_id),
        ref_id: tag_value(event, TAG_REF).map(str::to_string),
        payload: payload.to_string(),
    }))
}

/// Tags that are not `["file", name, ...]` are skipped; a missing metadata
/// element reads as empty metadata.
fn parse_catalog(event: &Event) -> CatalogAnnouncement {
    let entries = event
        .tags
        .iter()
        .filter_map(|t| {
            let values = t.as_slice();
            if values.first().map(String::as_str) != Some(TAG_FILE) {
                return None;
            }
            let name = values.get(1).filter(|n| !n.is_empty())?;
            Some(CatalogEntry {
                name: name.clone(),
                metadata: values.get(2).cloned().unwrap_or_default(),
            })
        })
        .collect();

    CatalogAnnouncement {
        advertiser: PeerIdentity::from(&event.pubkey),
        event_id: event.id.to_hex(),
        created_at: event.created_at.as_u64(),
        entries,
    }
}

/// Value of the first tag with the given name.
fn tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|t| {
        let values = t.as_slice();
        if values.first().map(String::as_str) == Some(name) {
            values.get(1).map(String::as_str)
        } else {
            None
        }
    })
}
