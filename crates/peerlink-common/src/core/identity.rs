//! Peer identities and session identifiers.

use nostr_sdk::PublicKey;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

use crate::core::error::ProtocolError;

/// Length of a peer identity in bytes (an x-only secp256k1 public key).
pub const PEER_IDENTITY_LEN: usize = 32;

/// Public key identifying a peer on the relay network.
///
/// Displayed and parsed as 64 lowercase hex characters, the same form used
/// in the `p` tag of signaling events.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity([u8; PEER_IDENTITY_LEN]);

impl PeerIdentity {
    pub const fn from_bytes(bytes: [u8; PEER_IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn to_public_key(&self) -> Result<PublicKey, ProtocolError> {
        PublicKey::from_slice(&self.0).map_err(|e| ProtocolError::InvalidIdentity(e.to_string()))
    }
}

impl From<PublicKey> for PeerIdentity {
    fn from(pk: PublicKey) -> Self {
        Self(pk.to_bytes())
    }
}

impl From<&PublicKey> for PeerIdentity {
    fn from(pk: &PublicKey) -> Self {
        Self(pk.to_bytes())
    }
}

impl FromStr for PeerIdentity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes =
            hex::decode(trimmed).map_err(|_| ProtocolError::InvalidIdentity(trimmed.to_string()))?;
        let bytes: [u8; PEER_IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidIdentity(trimmed.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({}..)", self.short())
    }
}

/// Identifier tying all signaling messages of one connection attempt
/// together. Never reused, not even for a reconnect to the same peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session ID (16 random bytes, hex-encoded)
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 16] = rng.gen();
        Self(hex::encode(bytes))
    }

    /// Wrap an identifier received from the wire. Other clients use UUIDs,
    /// so any non-empty string is accepted.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
