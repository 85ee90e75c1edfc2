//! Data channel wrapper handed to the transfer engine.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use peerlink_common::transport::{ChannelTransport, Frame, TransportEvents};

/// Sending file chunks pauses while more than this many bytes are queued in
/// the SCTP send buffer.
const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

pub struct WebRtcChannel {
    data_channel: Arc<RTCDataChannel>,
    // Owned here so the connection outlives the handshake
    peer_connection: Arc<RTCPeerConnection>,
    open: Arc<AtomicBool>,
}

impl WebRtcChannel {
    /// Wrap `data_channel` and route its callbacks to the node.
    pub fn attach(
        data_channel: Arc<RTCDataChannel>,
        peer_connection: Arc<RTCPeerConnection>,
        events: TransportEvents,
    ) -> Arc<Self> {
        let open = Arc::new(AtomicBool::new(false));
        let label = data_channel.label().to_string();

        let on_open_events = events.clone();
        let on_open_flag = open.clone();
        let on_open_label = label.clone();
        data_channel.on_open(Box::new(move || {
            Box::pin(async move {
                log::debug!("Data channel '{}' opened", on_open_label);
                on_open_flag.store(true, Ordering::SeqCst);
                on_open_events.channel_open().await;
            })
        }));

        let on_message_events = events.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = on_message_events.clone();
            Box::pin(async move {
                events.frame(to_frame(msg)).await;
            })
        }));

        let on_error_label = label.clone();
        data_channel.on_error(Box::new(move |err| {
            log::error!("Data channel '{}' error: {}", on_error_label, err);
            Box::pin(async {})
        }));

        let on_close_flag = open.clone();
        data_channel.on_close(Box::new(move || {
            let events = events.clone();
            let closed = on_close_flag.clone();
            let label = label.clone();
            Box::pin(async move {
                closed.store(false, Ordering::SeqCst);
                log::debug!("Data channel '{}' closed", label);
                events.closed().await;
            })
        }));

        Arc::new(Self {
            data_channel,
            peer_connection,
            open,
        })
    }

    /// Wait until the send buffer has room for `next` more bytes.
    async fn wait_for_buffer_space(&self, next: usize) -> Result<()> {
        loop {
            if self.data_channel.ready_state() != RTCDataChannelState::Open {
                return Err(anyhow!(
                    "Data channel '{}' closed during backpressure wait",
                    self.data_channel.label()
                ));
            }
            if self.data_channel.buffered_amount().await + next <= BUFFERED_AMOUNT_HIGH {
                return Ok(());
            }
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
    }
}

fn to_frame(msg: DataChannelMessage) -> Frame {
    if msg.is_string {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => return Frame::Text(text),
            Err(_) => log::debug!("Text message is not UTF-8, treating it as binary"),
        }
    }
    Frame::Binary(msg.data)
}

#[async_trait]
impl ChannelTransport for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.data_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        // Control frames skip the high-water wait so the node loop never
        // stalls behind a file being served on the same channel
        if frame.is_flow_controlled() {
            let len = match &frame {
                Frame::Binary(data) => data.len(),
                Frame::Text(text) => text.len(),
            };
            self.wait_for_buffer_space(len).await?;
        } else if self.data_channel.ready_state() != RTCDataChannelState::Open {
            return Err(anyhow!("Data channel '{}' is closed", self.data_channel.label()));
        }

        match frame {
            Frame::Text(text) => {
                self.data_channel
                    .send_text(text)
                    .await
                    .context("Failed to send text message")?;
            }
            Frame::Binary(data) => {
                self.data_channel
                    .send(&data)
                    .await
                    .context("Failed to send chunk")?;
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = self.data_channel.close().await {
            log::debug!("Failed to close data channel: {}", e);
        }
        if let Err(e) = self.peer_connection.close().await {
            log::debug!("Failed to close peer connection: {}", e);
        }
    }
}
