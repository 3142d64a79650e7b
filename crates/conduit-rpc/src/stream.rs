//! Stream feature: chunked byte/value streams over a dedicated MUX channel
//! (spec §4.6).
//!
//! The original design allocates a numeric handshake-id so a pre-created
//! pull reader can bind the first matching *anonymous* incoming channel.
//! `conduit-core` channels are opened with a caller-chosen string id, so
//! here the channel id itself *is* the handshake correlation -- no separate
//! binding step is needed (documented as a deliberate simplification in
//! DESIGN.md).

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use conduit_core::{ChannelInbox, ChannelSender, Transport};

use crate::error::RpcError;
use crate::wire::WireValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StreamFrame {
    Data(WireValue),
    End,
    Ack,
    Abort(String),
}

impl StreamFrame {
    fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("StreamFrame encoding is infallible")
    }

    fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Push-writer side of a stream: the opener. `close()` waits for the
/// reader's drain ack; `abort()` does not (spec §8 "Stream `close()` waits
/// for a drain ack; `abort(reason)` does not").
pub struct StreamWriter {
    channel_id: String,
    sender: ChannelSender,
    inbox: Mutex<ChannelInbox>,
}

impl StreamWriter {
    /// Open a new stream, sending the channel's `open-stream` handshake.
    pub async fn open(transport: &Transport, channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        let (sender, inbox) = transport
            .open_outgoing_stream_channel(channel_id.clone())
            .await;
        Self {
            channel_id,
            sender,
            inbox: Mutex::new(inbox),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn push(&self, item: WireValue) -> Result<(), RpcError> {
        self.sender
            .send(StreamFrame::Data(item).encode())
            .await
            .map_err(RpcError::from)
    }

    /// Send `stream-end` and wait for the reader's `stream-ack`.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.sender
            .send(StreamFrame::End.encode())
            .await
            .map_err(RpcError::from)?;

        loop {
            match self.inbox.lock().await.recv().await {
                Some(bytes) => match StreamFrame::decode(&bytes).map_err(|e| RpcError::Local(e.to_string()))? {
                    StreamFrame::Ack => return Ok(()),
                    StreamFrame::Abort(reason) => return Err(RpcError::Remote(reason)),
                    StreamFrame::Data(_) | StreamFrame::End => continue,
                },
                None => return Err(RpcError::LinkClosed),
            }
        }
    }

    /// Abnormal close: sends `stream-abort` and does not wait for anything.
    pub async fn abort(&self, reason: impl Into<String>) -> Result<(), RpcError> {
        self.sender
            .send(StreamFrame::Abort(reason.into()).encode())
            .await
            .map_err(RpcError::from)
    }
}

/// Pull-reader side of a stream: the acceptor. `recv()` returns `Ok(None)`
/// once the writer's `stream-end` has drained.
pub struct StreamReader {
    channel_id: String,
    sender: ChannelSender,
    inbox: ChannelInbox,
}

impl StreamReader {
    pub fn from_incoming(channel_id: String, sender: ChannelSender, inbox: ChannelInbox) -> Self {
        Self {
            channel_id,
            sender,
            inbox,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Pull the next chunk. `Ok(None)` means the stream ended normally; the
    /// drain ack has already been sent by the time this returns.
    pub async fn recv(&mut self) -> Result<Option<WireValue>, RpcError> {
        loop {
            match self.inbox.recv().await {
                Some(bytes) => match StreamFrame::decode(&bytes).map_err(|e| RpcError::Local(e.to_string()))? {
                    StreamFrame::Data(item) => return Ok(Some(item)),
                    StreamFrame::End => {
                        let _ = self.sender.send(StreamFrame::Ack.encode()).await;
                        return Ok(None);
                    }
                    StreamFrame::Abort(reason) => return Err(RpcError::Remote(reason)),
                    StreamFrame::Ack => continue,
                },
                None => return Ok(None),
            }
        }
    }
}
