//! Node configuration
//!
//! Every knob has a default matching what the CLI uses when the
//! corresponding flag is not given.

use anyhow::Result;
use std::time::Duration;

use crate::core::transfer::CHUNK_SIZE;

/// How long a session may sit in a pre-Connected state before it fails.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an outstanding file request may go without receiving data.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for a single reassembled file (2 GiB).
///
/// Files are buffered in memory until `file_end`, so this also bounds memory
/// use per channel against a peer that never stops sending.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Largest chunk size accepted from configuration (256 KiB).
///
/// SCTP messages above this size are not reliably delivered by browsers.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Interval of the node's timer tick (handshake and transfer timeouts).
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the internal event queues.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub handshake_timeout: Duration,
    pub transfer_timeout: Duration,
    pub chunk_size: usize,
    pub max_file_size: u64,
    /// Answer requests for unknown names with `file_not_found` instead of
    /// staying silent and letting the requester time out.
    pub reply_not_found: bool,
    pub housekeeping_interval: Duration,
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            transfer_timeout: TRANSFER_TIMEOUT,
            chunk_size: CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            reply_not_found: true,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
            event_buffer: EVENT_BUFFER,
        }
    }
}

impl NodeConfig {
    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "Chunk size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE,
                self.chunk_size
            );
        }
        if self.handshake_timeout.is_zero() {
            anyhow::bail!("Handshake timeout must be greater than zero");
        }
        if self.transfer_timeout.is_zero() {
            anyhow::bail!("Transfer timeout must be greater than zero");
        }
        if self.housekeeping_interval.is_zero() {
            anyhow::bail!("Housekeeping interval must be greater than zero");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("Event buffer must hold at least one event");
        }
        Ok(())
    }
}
