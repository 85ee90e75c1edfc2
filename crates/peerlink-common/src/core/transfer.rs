//! File transfer protocol over an open data channel.
//!
//! Text frames carry JSON control messages, binary frames carry raw file
//! chunks. A requester sends `file_request`; the serving side answers with
//! the file's bytes in order followed by `file_end` (or `file_not_found`).
//! Chunks carry no header: the channel is reliable and ordered, and the
//! requester keeps at most one request outstanding, so every binary frame
//! belongs to that request.
//!
//! A binary frame or `file_end` arriving while no request is outstanding is
//! dropped. It does not start an unnamed transfer, unlike a receiver that
//! treats the first chunk after a `file_end` as the start of the next file.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::core::catalog::{ContentHandle, FileDescriptor};
use crate::core::error::TransferError;
use crate::transport::Frame;

/// Default chunk size for binary frames (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    FileRequest { filename: String },
    FileEnd,
    FileNotFound { filename: String },
    Message { text: String },
}

impl ControlMessage {
    pub fn to_frame(&self) -> Result<Frame, TransferError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(|e| TransferError::Io(e.to_string()))
    }
}

/// An inbound frame after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Chunk(Bytes),
    /// Text that is not a control message. Treated as chat.
    Text(String),
}

pub fn classify(frame: Frame) -> Inbound {
    match frame {
        Frame::Binary(data) => Inbound::Chunk(data),
        Frame::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
            Ok(control) => Inbound::Control(control),
            Err(_) => Inbound::Text(text),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ReceiveState {
    #[default]
    Idle,
    Assembling,
    /// The size limit was crossed. Chunks are dropped until `file_end`.
    Overflowed,
}

/// Receive-side buffer for the file currently being transferred.
#[derive(Debug)]
pub struct Reassembly {
    fragments: Vec<Bytes>,
    received: u64,
    limit: u64,
    state: ReceiveState,
}

impl Reassembly {
    pub fn new(limit: u64) -> Self {
        Self {
            fragments: Vec::new(),
            received: 0,
            limit,
            state: ReceiveState::Idle,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state != ReceiveState::Idle
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn push(&mut self, chunk: Bytes) {
        match self.state {
            ReceiveState::Overflowed => {}
            ReceiveState::Idle | ReceiveState::Assembling => {
                let total = self.received.saturating_add(chunk.len() as u64);
                if total > self.limit {
                    log::warn!(
                        "Incoming file exceeds {} bytes, discarding until file_end",
                        self.limit
                    );
                    self.fragments.clear();
                    self.received = 0;
                    self.state = ReceiveState::Overflowed;
                    return;
                }
                self.received = total;
                self.fragments.push(chunk);
                self.state = ReceiveState::Assembling;
            }
        }
    }

    /// Concatenate the fragments in arrival order and reset.
    pub fn finish(&mut self) -> Result<Bytes, TransferError> {
        let state = std::mem::take(&mut self.state);
        let fragments = std::mem::take(&mut self.fragments);
        let received = std::mem::take(&mut self.received);

        if state == ReceiveState::Overflowed {
            return Err(TransferError::TooLarge { limit: self.limit });
        }

        let mut buf = BytesMut::with_capacity(received as usize);
        for fragment in fragments {
            buf.extend_from_slice(&fragment);
        }
        Ok(buf.freeze())
    }

    pub fn discard(&mut self) {
        self.fragments.clear();
        self.received = 0;
        self.state = ReceiveState::Idle;
    }
}

enum ChunkSource {
    File(File),
    Memory(Bytes),
}

/// Send-side state of one file being served.
pub struct OutgoingTransfer {
    name: String,
    source: ChunkSource,
    size: u64,
    offset: u64,
    chunk_size: usize,
}

impl OutgoingTransfer {
    pub async fn open(descriptor: &FileDescriptor, chunk_size: usize) -> Result<Self> {
        let (source, size) = match &descriptor.content {
            ContentHandle::Memory(data) => (ChunkSource::Memory(data.clone()), data.len() as u64),
            ContentHandle::Path(path) => {
                let file = File::open(path)
                    .await
                    .with_context(|| format!("Failed to open file: {}", path.display()))?;
                // The file may have changed since it was advertised
                let size = file
                    .metadata()
                    .await
                    .context("Failed to read file metadata")?
                    .len();
                (ChunkSource::File(file), size)
            }
        };

        Ok(Self {
            name: descriptor.name.clone(),
            source,
            size,
            offset: 0,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }

    /// Read the next chunk. Every chunk is `chunk_size` bytes except the
    /// last, which may be shorter. Returns `None` once the file is done.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.is_complete() {
            return Ok(None);
        }

        let remaining = self.size - self.offset;
        let to_read = std::cmp::min(self.chunk_size as u64, remaining) as usize;

        let chunk = match &mut self.source {
            ChunkSource::Memory(data) => {
                let start = self.offset as usize;
                data.slice(start..start + to_read)
            }
            ChunkSource::File(file) => {
                let mut buffer = vec![0u8; to_read];
                file.read_exact(&mut buffer)
                    .await
                    .with_context(|| format!("Failed to read '{}' at offset {}", self.name, self.offset))?;
                Bytes::from(buffer)
            }
        };

        self.offset += to_read as u64;
        Ok(Some(chunk))
    }
}

#[derive(Debug)]
struct Outstanding {
    filename: String,
    deadline: Instant,
}

/// Requester-side FIFO of file requests.
///
/// At most one request is on the wire at a time. The next one is released
/// when the outstanding request completes, fails or times out.
#[derive(Debug)]
pub struct RequestQueue {
    waiting: VecDeque<String>,
    outstanding: Option<Outstanding>,
    timeout: Duration,
}

impl RequestQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiting: VecDeque::new(),
            outstanding: None,
            timeout,
        }
    }

    pub fn enqueue(&mut self, filename: String) {
        self.waiting.push_back(filename);
    }

    /// Release the next waiting request if nothing is outstanding.
    pub fn advance(&mut self, now: Instant) -> Option<String> {
        if self.outstanding.is_some() {
            return None;
        }
        let filename = self.waiting.pop_front()?;
        self.outstanding = Some(Outstanding {
            filename: filename.clone(),
            deadline: now + self.timeout,
        });
        Some(filename)
    }

    /// Data arrived for the outstanding request.
    pub fn touch(&mut self, now: Instant) {
        if let Some(outstanding) = &mut self.outstanding {
            outstanding.deadline = now + self.timeout;
        }
    }

    /// Take the outstanding request, whether it finished or is given up on.
    pub fn abandon(&mut self) -> Option<String> {
        self.outstanding.take().map(|o| o.filename)
    }

    pub fn outstanding(&self) -> Option<&str> {
        self.outstanding.as_ref().map(|o| o.filename.as_str())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.outstanding
            .as_ref()
            .map(|o| now >= o.deadline)
            .unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.outstanding.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, outstanding request first.
    pub fn drain(&mut self) -> Vec<String> {
        let mut all: Vec<String> = self.abandon().into_iter().collect();
        all.extend(self.waiting.drain(..));
        all
    }
}
