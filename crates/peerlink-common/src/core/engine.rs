//! Transfer engine: owns one open data channel to one peer.
//!
//! The engine plays both roles of the transfer protocol at once. As a
//! requester it keeps a FIFO of file requests with one outstanding at a
//! time, reassembles inbound chunks and times out stalled requests. As a
//! server it hands inbound `file_request`s to a background task that
//! streams files from the shared catalog one after another.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::NodeConfig;
use crate::core::catalog::{FileDescriptor, SharedCatalog};
use crate::core::error::TransferError;
use crate::core::identity::{PeerIdentity, SessionId};
use crate::core::session::Role;
use crate::core::transfer::{
    classify, ControlMessage, Inbound, OutgoingTransfer, Reassembly, RequestQueue,
};
use crate::transport::{ChannelTransport, Frame};

/// Inbound file requests waiting to be served. Requests beyond this are
/// dropped and the requester times out.
const SERVE_QUEUE_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    FileReceived { filename: String, data: Bytes },
    TransferFailed { filename: String, error: TransferError },
    MessageReceived { text: String },
}

pub struct TransferEngine {
    peer: PeerIdentity,
    session_id: SessionId,
    role: Role,
    channel: Arc<dyn ChannelTransport>,
    reassembly: Reassembly,
    requests: RequestQueue,
    serve_tx: mpsc::Sender<String>,
    serve_task: JoinHandle<()>,
    closed: bool,
}

impl TransferEngine {
    pub fn new(
        peer: PeerIdentity,
        session_id: SessionId,
        role: Role,
        channel: Arc<dyn ChannelTransport>,
        catalog: SharedCatalog,
        config: &NodeConfig,
    ) -> Self {
        let (serve_tx, serve_rx) = mpsc::channel(SERVE_QUEUE_SIZE);
        let serve_task = tokio::spawn(serve_requests(
            Server {
                peer,
                channel: channel.clone(),
                catalog,
                chunk_size: config.chunk_size,
                reply_not_found: config.reply_not_found,
            },
            serve_rx,
        ));

        Self {
            peer,
            session_id,
            role,
            channel,
            reassembly: Reassembly::new(config.max_file_size),
            requests: RequestQueue::new(config.transfer_timeout),
            serve_tx,
            serve_task,
            closed: false,
        }
    }

    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        !self.closed && self.channel.is_open()
    }

    /// Requests queued or outstanding.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Queue a file request. Sent immediately when nothing is outstanding.
    ///
    /// Fails with `ChannelNotReady` without touching the queue or the channel
    /// if the channel is not open.
    pub async fn request_file(&mut self, filename: String) -> Result<(), TransferError> {
        if !self.is_open() {
            return Err(TransferError::ChannelNotReady);
        }

        self.requests.enqueue(filename);
        if let Some(next) = self.requests.advance(Instant::now()) {
            if let Err(e) = self
                .send_control(ControlMessage::FileRequest { filename: next })
                .await
            {
                self.requests.abandon();
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn send_message(&mut self, text: String) -> Result<(), TransferError> {
        if !self.is_open() {
            return Err(TransferError::ChannelNotReady);
        }
        self.send_control(ControlMessage::Message { text }).await
    }

    pub async fn handle_frame(&mut self, frame: Frame) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        match classify(frame) {
            Inbound::Chunk(data) => {
                if self.requests.outstanding().is_some() {
                    self.reassembly.push(data);
                    self.requests.touch(Instant::now());
                } else {
                    log::debug!(
                        "Dropping {} byte chunk from {} with no request outstanding",
                        data.len(),
                        self.peer.short()
                    );
                }
            }

            Inbound::Control(ControlMessage::FileEnd) => {
                match self.requests.abandon() {
                    Some(filename) => match self.reassembly.finish() {
                        Ok(data) => {
                            log::debug!(
                                "Received '{}' ({} bytes) from {}",
                                filename,
                                data.len(),
                                self.peer.short()
                            );
                            events.push(EngineEvent::FileReceived { filename, data });
                        }
                        Err(error) => events.push(EngineEvent::TransferFailed { filename, error }),
                    },
                    None => {
                        log::debug!("Ignoring file_end from {} with no request outstanding", self.peer.short());
                        self.reassembly.discard();
                    }
                }
                self.dispatch_next(&mut events).await;
            }

            Inbound::Control(ControlMessage::FileNotFound { filename }) => {
                if self.requests.outstanding() == Some(filename.as_str()) {
                    self.requests.abandon();
                    self.reassembly.discard();
                    events.push(EngineEvent::TransferFailed {
                        error: TransferError::TargetMissing(filename.clone()),
                        filename,
                    });
                    self.dispatch_next(&mut events).await;
                } else {
                    log::debug!("Ignoring file_not_found for '{}' (not outstanding)", filename);
                }
            }

            Inbound::Control(ControlMessage::FileRequest { filename }) => {
                if let Err(e) = self.serve_tx.try_send(filename) {
                    log::warn!("Dropping file request from {}: {}", self.peer.short(), e);
                }
            }

            Inbound::Control(ControlMessage::Message { text }) | Inbound::Text(text) => {
                events.push(EngineEvent::MessageReceived { text });
            }
        }

        events
    }

    /// Fail the outstanding request if it has gone quiet for too long, and
    /// move on to the next one.
    pub async fn poll_timeout(&mut self, now: Instant) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if !self.requests.is_expired(now) {
            return events;
        }

        if let Some(filename) = self.requests.abandon() {
            log::warn!(
                "Request for '{}' from {} timed out after {:?}",
                filename,
                self.peer.short(),
                self.requests.timeout()
            );
            self.reassembly.discard();
            events.push(EngineEvent::TransferFailed {
                filename,
                error: TransferError::Timeout(self.requests.timeout()),
            });
        }
        self.dispatch_next(&mut events).await;
        events
    }

    /// Close the channel and fail every pending request.
    pub async fn close(&mut self) -> Vec<EngineEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.serve_task.abort();
        self.channel.close().await;
        self.reassembly.discard();

        self.requests
            .drain()
            .into_iter()
            .map(|filename| EngineEvent::TransferFailed {
                filename,
                error: TransferError::ChannelClosed,
            })
            .collect()
    }

    async fn dispatch_next(&mut self, events: &mut Vec<EngineEvent>) {
        while let Some(filename) = self.requests.advance(Instant::now()) {
            match self
                .send_control(ControlMessage::FileRequest {
                    filename: filename.clone(),
                })
                .await
            {
                Ok(()) => break,
                Err(error) => {
                    self.requests.abandon();
                    events.push(EngineEvent::TransferFailed { filename, error });
                }
            }
        }
    }

    async fn send_control(&self, message: ControlMessage) -> Result<(), TransferError> {
        let frame = message.to_frame()?;
        self.channel.send(frame).await.map_err(|e| {
            log::debug!("Send to {} failed: {:#}", self.peer.short(), e);
            TransferError::ChannelClosed
        })
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

struct Server {
    peer: PeerIdentity,
    channel: Arc<dyn ChannelTransport>,
    catalog: SharedCatalog,
    chunk_size: usize,
    reply_not_found: bool,
}

/// Serve inbound requests one at a time, in arrival order.
async fn serve_requests(server: Server, mut requests: mpsc::Receiver<String>) {
    while let Some(filename) = requests.recv().await {
        let descriptor = server
            .catalog
            .read()
            .ok()
            .and_then(|catalog| catalog.get(&filename).cloned());

        let Some(descriptor) = descriptor else {
            log::info!("{} requested unknown file '{}'", server.peer.short(), filename);
            if server.reply_not_found {
                server.send_not_found(filename).await;
            }
            continue;
        };

        match server.send_file(&descriptor).await {
            Ok(sent) => {
                log::info!(
                    "Sent '{}' ({} bytes) to {}",
                    descriptor.name,
                    sent,
                    server.peer.short()
                );
            }
            Err(e) => {
                log::warn!(
                    "Failed to send '{}' to {}: {:#}",
                    descriptor.name,
                    server.peer.short(),
                    e
                );
                if !server.channel.is_open() {
                    break;
                }
                // Let the requester drop whatever partial data it has
                if server.reply_not_found {
                    server.send_not_found(filename).await;
                }
            }
        }
    }
}

impl Server {
    async fn send_file(&self, descriptor: &FileDescriptor) -> Result<u64> {
        let mut transfer = OutgoingTransfer::open(descriptor, self.chunk_size).await?;
        while let Some(chunk) = transfer.next_chunk().await? {
            self.channel.send(Frame::Binary(chunk)).await?;
        }
        self.channel.send(ControlMessage::FileEnd.to_frame()?).await?;
        Ok(transfer.offset())
    }

    async fn send_not_found(&self, filename: String) {
        let frame = match (ControlMessage::FileNotFound { filename }).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to encode file_not_found: {}", e);
                return;
            }
        };
        if let Err(e) = self.channel.send(frame).await {
            log::debug!("Failed to send file_not_found to {}: {:#}", self.peer.short(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{Catalog, FileDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        closed: AtomicBool,
        sent: Mutex<Vec<Frame>>,
    }

    impl RecordingChannel {
        fn frames(&self) -> Vec<Frame> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelTransport for RecordingChannel {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn send(&self, frame: Frame) -> Result<()> {
            if !self.is_open() {
                anyhow::bail!("closed");
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Channel whose send buffer never drains: flow-controlled frames wait
    /// forever, everything else goes through.
    #[derive(Default)]
    struct CongestedChannel {
        blocked_sends: AtomicUsize,
        sent: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl ChannelTransport for CongestedChannel {
        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, frame: Frame) -> Result<()> {
            if frame.is_flow_controlled() {
                self.blocked_sends.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&self) {}
    }

    fn request(name: &str) -> Frame {
        ControlMessage::FileRequest {
            filename: name.to_string(),
        }
        .to_frame()
        .unwrap()
    }

    fn file_end() -> Frame {
        ControlMessage::FileEnd.to_frame().unwrap()
    }

    fn engine_with(catalog: Catalog, config: NodeConfig) -> (TransferEngine, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let engine = TransferEngine::new(
            PeerIdentity::from_bytes([9; 32]),
            SessionId::new("s"),
            Role::Initiator,
            channel.clone(),
            catalog.into_shared(),
            &config,
        );
        (engine, channel)
    }

    fn engine() -> (TransferEngine, Arc<RecordingChannel>) {
        engine_with(Catalog::default(), NodeConfig::default())
    }

    async fn wait_for_frames(channel: &RecordingChannel, count: usize) -> Vec<Frame> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frames = channel.frames();
                if frames.len() >= count {
                    return frames;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("serve task did not send enough frames")
    }

    #[tokio::test]
    async fn test_request_on_closed_channel() {
        let (mut engine, channel) = engine();
        channel.close().await;

        assert_eq!(
            engine.request_file("a.txt".to_string()).await,
            Err(TransferError::ChannelNotReady)
        );
        assert_eq!(
            engine.send_message("hi".to_string()).await,
            Err(TransferError::ChannelNotReady)
        );
        assert!(channel.frames().is_empty());
        assert_eq!(engine.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_requests_are_sent_one_at_a_time() {
        let (mut engine, channel) = engine();
        engine.request_file("a.txt".to_string()).await.unwrap();
        engine.request_file("b.txt".to_string()).await.unwrap();
        assert_eq!(channel.frames(), vec![request("a.txt")]);
        assert_eq!(engine.pending_requests(), 2);

        engine.handle_frame(Frame::Binary(Bytes::from_static(b"hello "))).await;
        engine.handle_frame(Frame::Binary(Bytes::from_static(b"world"))).await;
        let events = engine.handle_frame(file_end()).await;

        assert_eq!(
            events,
            vec![EngineEvent::FileReceived {
                filename: "a.txt".to_string(),
                data: Bytes::from_static(b"hello world"),
            }]
        );
        assert_eq!(channel.frames(), vec![request("a.txt"), request("b.txt")]);
    }

    #[tokio::test]
    async fn test_file_not_found_moves_to_next_request() {
        let (mut engine, channel) = engine();
        engine.request_file("missing".to_string()).await.unwrap();
        engine.request_file("next".to_string()).await.unwrap();

        let not_found = ControlMessage::FileNotFound {
            filename: "missing".to_string(),
        }
        .to_frame()
        .unwrap();
        let events = engine.handle_frame(not_found).await;

        assert_eq!(
            events,
            vec![EngineEvent::TransferFailed {
                filename: "missing".to_string(),
                error: TransferError::TargetMissing("missing".to_string()),
            }]
        );
        assert_eq!(channel.frames().last(), Some(&request("next")));
    }

    #[tokio::test]
    async fn test_stray_frames_are_ignored() {
        let (mut engine, _channel) = engine();
        assert!(engine
            .handle_frame(Frame::Binary(Bytes::from_static(b"late")))
            .await
            .is_empty());
        assert!(engine.handle_frame(file_end()).await.is_empty());

        engine.request_file("a".to_string()).await.unwrap();
        engine.handle_frame(Frame::Binary(Bytes::from_static(b"fresh"))).await;
        let events = engine.handle_frame(file_end()).await;
        assert_eq!(
            events,
            vec![EngineEvent::FileReceived {
                filename: "a".to_string(),
                data: Bytes::from_static(b"fresh"),
            }]
        );
    }

    #[tokio::test]
    async fn test_timeout_discards_and_advances() {
        let config = NodeConfig {
            transfer_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let (mut engine, channel) = engine_with(Catalog::default(), config);
        engine.request_file("slow".to_string()).await.unwrap();
        engine.request_file("next".to_string()).await.unwrap();
        engine.handle_frame(Frame::Binary(Bytes::from_static(b"part"))).await;

        assert!(engine.poll_timeout(Instant::now()).await.is_empty());

        let later = Instant::now() + Duration::from_secs(31);
        let events = engine.poll_timeout(later).await;
        assert_eq!(
            events,
            vec![EngineEvent::TransferFailed {
                filename: "slow".to_string(),
                error: TransferError::Timeout(Duration::from_secs(30)),
            }]
        );
        assert_eq!(channel.frames().last(), Some(&request("next")));

        // Partial data from the abandoned request is gone
        let events = engine.handle_frame(file_end()).await;
        assert_eq!(
            events,
            vec![EngineEvent::FileReceived {
                filename: "next".to_string(),
                data: Bytes::new(),
            }]
        );
    }

    #[tokio::test]
    async fn test_oversized_file_fails() {
        let config = NodeConfig {
            max_file_size: 8,
            ..Default::default()
        };
        let (mut engine, _channel) = engine_with(Catalog::default(), config);
        engine.request_file("big".to_string()).await.unwrap();
        engine.handle_frame(Frame::Binary(Bytes::from_static(b"12345"))).await;
        engine.handle_frame(Frame::Binary(Bytes::from_static(b"67890"))).await;

        let events = engine.handle_frame(file_end()).await;
        assert_eq!(
            events,
            vec![EngineEvent::TransferFailed {
                filename: "big".to_string(),
                error: TransferError::TooLarge { limit: 8 },
            }]
        );
    }

    #[tokio::test]
    async fn test_chat_messages() {
        let (mut engine, channel) = engine();
        engine.send_message("hi there".to_string()).await.unwrap();
        assert_eq!(
            channel.frames(),
            vec![Frame::Text(r#"{"type":"message","text":"hi there"}"#.to_string())]
        );

        let events = engine.handle_frame(Frame::Text("plain text".to_string())).await;
        assert_eq!(
            events,
            vec![EngineEvent::MessageReceived {
                text: "plain text".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_serves_catalog_file_in_chunks() {
        let catalog = Catalog::new(vec![FileDescriptor::from_bytes("a.txt", "hello world")]).unwrap();
        let config = NodeConfig {
            chunk_size: 4,
            ..Default::default()
        };
        let (mut engine, channel) = engine_with(catalog, config);

        assert!(engine.handle_frame(request("a.txt")).await.is_empty());
        let frames = wait_for_frames(&channel, 4).await;
        assert_eq!(
            frames,
            vec![
                Frame::Binary(Bytes::from_static(b"hell")),
                Frame::Binary(Bytes::from_static(b"o wo")),
                Frame::Binary(Bytes::from_static(b"rld")),
                file_end(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_file_reply() {
        let (mut engine, channel) = engine();
        engine.handle_frame(request("nope")).await;
        let frames = wait_for_frames(&channel, 1).await;
        assert_eq!(
            frames,
            vec![ControlMessage::FileNotFound {
                filename: "nope".to_string()
            }
            .to_frame()
            .unwrap()]
        );
    }

    #[tokio::test]
    async fn test_unknown_file_silent_when_disabled() {
        let config = NodeConfig {
            reply_not_found: false,
            ..Default::default()
        };
        let catalog = Catalog::new(vec![FileDescriptor::from_bytes("x", "x")]).unwrap();
        let (mut engine, channel) = engine_with(catalog, config);
        engine.handle_frame(request("nope")).await;
        // A later known request proves the unknown one was skipped silently
        engine.handle_frame(request("x")).await;

        let frames = wait_for_frames(&channel, 2).await;
        assert_eq!(frames, vec![Frame::Binary(Bytes::from_static(b"x")), file_end()]);
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (mut engine, channel) = engine();
        engine.request_file("a".to_string()).await.unwrap();
        engine.request_file("b".to_string()).await.unwrap();

        let events = engine.close().await;
        assert_eq!(
            events,
            vec![
                EngineEvent::TransferFailed {
                    filename: "a".to_string(),
                    error: TransferError::ChannelClosed,
                },
                EngineEvent::TransferFailed {
                    filename: "b".to_string(),
                    error: TransferError::ChannelClosed,
                },
            ]
        );
        assert!(!channel.is_open());
        assert!(!engine.is_open());
        assert!(engine.close().await.is_empty());
    }

    #[tokio::test]
    async fn test_control_frames_pass_a_congested_channel() {
        let catalog =
            Catalog::new(vec![FileDescriptor::from_bytes("big.bin", vec![7u8; 64])]).unwrap();
        let channel = Arc::new(CongestedChannel::default());
        let config = NodeConfig {
            chunk_size: 16,
            ..Default::default()
        };
        let mut engine = TransferEngine::new(
            PeerIdentity::from_bytes([9; 32]),
            SessionId::new("s"),
            Role::Responder,
            channel.clone(),
            catalog.into_shared(),
            &config,
        );

        // The serve task gets stuck on its first chunk
        engine.handle_frame(request("big.bin")).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.blocked_sends.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("serve task never started sending");

        tokio::time::timeout(Duration::from_secs(5), async {
            engine.request_file("theirs.txt".to_string()).await.unwrap();
            engine.send_message("still here".to_string()).await.unwrap();
        })
        .await
        .expect("control frames waited behind file data");

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                request("theirs.txt"),
                Frame::Text(r#"{"type":"message","text":"still here"}"#.to_string()),
            ]
        );
    }
}
