//! The [`Transport`] surface: a singleton control channel plus on-demand
//! outgoing/incoming stream channels over one [`Muxer`] (spec §4.3).
//!
//! The spec describes this surface in callback terms
//! (`on_incoming_stream_channel(handler)`, `on_close(handler)`). We translate
//! that into a pull-based API: [`Transport::accept_incoming`] suspends until
//! the peer opens a channel, which composes more naturally with `tokio`
//! task/select patterns than closure registration (design note, spec §9).

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::channel::{ChannelInbox, ChannelSender};
use crate::config::{ChannelConfig, MuxerConfig};
use crate::link::DynLink;
use crate::muxer::{IncomingChannel, Muxer};
use crate::packet::CONTROL_CHANNEL_ID;

/// One end of a MUX connection: the control channel plus the ability to
/// open outgoing channels and accept incoming ones.
pub struct Transport {
    muxer: Muxer,
    control_sender: ChannelSender,
    control_inbox: AsyncMutex<ChannelInbox>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<IncomingChannel>>,
}

impl Transport {
    /// Establish a transport over `link`: spawns the muxer and opens the
    /// control channel. Both ends of a link should call this so the control
    /// channel's handshake completes symmetrically.
    pub async fn connect(link: DynLink, muxer_config: MuxerConfig, channel_config: ChannelConfig) -> Self {
        let (muxer, incoming) = Muxer::spawn(link, muxer_config, channel_config);
        let (control_sender, control_inbox) = muxer.open_channel(CONTROL_CHANNEL_ID.to_string()).await;
        Self {
            muxer,
            control_sender,
            control_inbox: AsyncMutex::new(control_inbox),
            incoming: AsyncMutex::new(incoming),
        }
    }

    /// The singleton control channel's sender half.
    pub fn control_sender(&self) -> &ChannelSender {
        &self.control_sender
    }

    /// Receive the next payload on the control channel.
    pub async fn control_recv(&self) -> Option<Vec<u8>> {
        self.control_inbox.lock().await.recv().await
    }

    /// Open a new outgoing stream channel, sending the `open-stream`
    /// handshake packet.
    pub async fn open_outgoing_stream_channel(&self, channel_id: String) -> (ChannelSender, ChannelInbox) {
        self.muxer.open_channel(channel_id).await
    }

    /// Suspend until the peer opens a new stream channel (or the transport
    /// closes, in which case this returns `None`).
    pub async fn accept_incoming(&self) -> Option<IncomingChannel> {
        self.incoming.lock().await.recv().await
    }

    /// Close the transport and its underlying link. Idempotent.
    pub fn close(&self) {
        self.muxer.close();
    }

    pub fn abort(&self, reason: String) {
        tracing::warn!(reason, "transport aborted");
        self.muxer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.muxer.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_link::MemLink;

    #[tokio::test]
    async fn control_channel_established_both_sides() {
        let (a, b) = MemLink::pair();
        let ta = Transport::connect(a, MuxerConfig::default(), ChannelConfig::default()).await;
        let tb = Transport::connect(b, MuxerConfig::default(), ChannelConfig::default()).await;

        ta.control_sender().send(b"hi".to_vec()).await.unwrap();
        let got = tb.control_recv().await.unwrap();
        assert_eq!(got, b"hi");
    }

    #[tokio::test]
    async fn accept_incoming_sees_peer_opened_channels() {
        let (a, b) = MemLink::pair();
        let ta = Transport::connect(a, MuxerConfig::default(), ChannelConfig::default()).await;
        let tb = Transport::connect(b, MuxerConfig::default(), ChannelConfig::default()).await;

        let (sender, _inbox) = ta.open_outgoing_stream_channel("stream-1".into()).await;
        let incoming = tb.accept_incoming().await.expect("peer opened a channel");
        assert_eq!(incoming.channel_id, "stream-1");
        assert!(!sender.is_closed());
    }
}
