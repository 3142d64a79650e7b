//! The [`Muxer`]: heartbeat liveness and packet demultiplexing over a
//! [`Link`] (spec §4.1).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::channel::{ChannelInbox, ChannelReceiver, ChannelSender};
use crate::config::{ChannelConfig, MuxerConfig};
use crate::error::MuxError;
use crate::link::DynLink;
use crate::packet::{Packet, CONTROL_CHANNEL_ID};

/// A channel opened by the remote peer, handed to whatever is listening via
/// [`Muxer::incoming_channels`] (the transport-level equivalent of the
/// spec's `on_incoming_stream_channel` callback).
pub struct IncomingChannel {
    pub channel_id: String,
    pub sender: ChannelSender,
    pub inbox: ChannelInbox,
}

struct ChannelEntry {
    sender: ChannelSender,
    receiver: AsyncMutex<ChannelReceiver>,
}

struct MuxerInner {
    link: DynLink,
    config: MuxerConfig,
    channel_config: ChannelConfig,
    channels: Mutex<HashMap<String, Arc<ChannelEntry>>>,
    last_activity_millis: AtomicU64,
    closed: AtomicBool,
    incoming_tx: mpsc::UnboundedSender<IncomingChannel>,
}

/// Demultiplexes a [`Link`] into reliable, independently-flow-controlled
/// channels, and maintains liveness via ping/pong heartbeats.
///
/// Spawning a muxer starts two background tasks: a read loop dispatching
/// incoming packets, and a heartbeat loop. Both stop when the link closes
/// or [`Muxer::close`] is called.
#[derive(Clone)]
pub struct Muxer {
    inner: Arc<MuxerInner>,
}

impl Muxer {
    /// Spawn a muxer over `link`. Returns the handle plus a channel of
    /// peer-initiated streams.
    pub fn spawn(
        link: DynLink,
        config: MuxerConfig,
        channel_config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<IncomingChannel>) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MuxerInner {
            link,
            config,
            channel_config,
            channels: Mutex::new(HashMap::new()),
            last_activity_millis: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            incoming_tx,
        });
        let muxer = Self { inner };

        tokio::spawn(muxer.clone().read_loop());
        tokio::spawn(muxer.clone().heartbeat_loop());

        (muxer, incoming_rx)
    }

    fn touch(&self) {
        // Monotonic millis since muxer creation would require a clock
        // dependency; instead we just bump a counter on every observed
        // packet and have the heartbeat loop compare counter deltas.
        self.inner.last_activity_millis.fetch_add(1, Ordering::Relaxed);
    }

    async fn read_loop(self) {
        loop {
            match self.inner.link.recv().await {
                Ok(packet) => {
                    self.touch();
                    self.dispatch(packet).await;
                }
                Err(_) => {
                    self.teardown();
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Ping => {
                let _ = self.inner.link.send(Packet::Pong).await;
            }
            Packet::Pong => {
                // Liveness already recorded by `touch` in the read loop.
            }
            Packet::OpenStream { channel_id } => {
                // Both peers proactively `open_channel` the control channel
                // from `Transport::connect`, so seeing our own control
                // channel id come back is the expected symmetric handshake,
                // not a collision. Any other already-open id means two
                // genuinely distinct streams picked the same id, which spec
                // §9(b) treats as a fatal protocol error.
                let is_control = channel_id == CONTROL_CHANNEL_ID;
                let already_open = self.inner.channels.lock().contains_key(&channel_id);
                if already_open && !is_control {
                    tracing::warn!(channel_id, "duplicate channel id on open-stream, aborting link");
                    self.abort_protocol(format!("duplicate channel id '{channel_id}' on open-stream"));
                    return;
                }
                if !already_open {
                    let (sender, receiver, inbox) = self.new_channel_pair(channel_id.clone());
                    // The acceptor never queues pre-handshake: the ack the
                    // initiator is waiting for *is* our completion signal.
                    sender.mark_established();
                    self.inner.channels.lock().insert(
                        channel_id.clone(),
                        Arc::new(ChannelEntry {
                            sender: sender.clone(),
                            receiver: AsyncMutex::new(receiver),
                        }),
                    );
                    let _ = self.inner.incoming_tx.send(IncomingChannel {
                        channel_id: channel_id.clone(),
                        sender,
                        inbox,
                    });
                }
                let _ = self
                    .inner
                    .link
                    .send(Packet::OpenStreamAck { channel_id })
                    .await;
            }
            Packet::OpenStreamAck { channel_id } => {
                if let Some(entry) = self.inner.channels.lock().get(&channel_id) {
                    entry.sender.mark_established();
                }
            }
            Packet::Data {
                channel_id,
                seq,
                payload,
            } => {
                let entry = self.inner.channels.lock().get(&channel_id).cloned();
                match entry {
                    Some(entry) => entry.receiver.lock().await.on_data(seq, payload).await,
                    None => tracing::debug!(channel_id, "data for unknown channel, dropping"),
                }
            }
            Packet::Ack { channel_id, ack_seq } => {
                if let Some(entry) = self.inner.channels.lock().get(&channel_id) {
                    entry.sender.handle_ack(ack_seq);
                }
            }
            Packet::CloseChannel { channel_id, reason } => {
                tracing::debug!(channel_id, ?reason, "peer closed channel");
                self.inner.channels.lock().remove(&channel_id);
            }
        }
    }

    fn new_channel_pair(
        &self,
        channel_id: String,
    ) -> (ChannelSender, ChannelReceiver, ChannelInbox) {
        let sender = ChannelSender::new(
            channel_id.clone(),
            Arc::clone(&self.inner.link),
            self.inner.channel_config,
        );
        let (receiver, inbox) = ChannelReceiver::new(
            channel_id,
            Arc::clone(&self.inner.link),
            self.inner.channel_config,
        );
        (sender, receiver, inbox)
    }

    /// Open a new channel, sending the initial `open-stream` handshake
    /// packet. The returned sender starts in
    /// [`crate::ChannelStatus::PreHandshake`] until the peer acks.
    pub async fn open_channel(&self, channel_id: String) -> (ChannelSender, ChannelInbox) {
        let (sender, receiver, inbox) = self.new_channel_pair(channel_id.clone());
        self.inner.channels.lock().insert(
            channel_id.clone(),
            Arc::new(ChannelEntry {
                sender: sender.clone(),
                receiver: Mutex::new(receiver),
            }),
        );
        let _ = self
            .inner
            .link
            .send(Packet::OpenStream { channel_id })
            .await;
        (sender, inbox)
    }

    async fn heartbeat_loop(self) {
        let mut last_seen = self.inner.last_activity_millis.load(Ordering::Relaxed);
        let mut silent_ticks = 0u32;
        let max_silent_ticks = (self.inner.config.heartbeat_timeout.as_secs_f64()
            / self.inner.config.heartbeat_interval.as_secs_f64())
        .ceil() as u32;

        loop {
            tokio::time::sleep(self.inner.config.heartbeat_interval).await;
            if self.inner.closed.load(Ordering::Acquire) {
                return;
            }

            let current = self.inner.last_activity_millis.load(Ordering::Relaxed);
            if current == last_seen {
                silent_ticks += 1;
            } else {
                silent_ticks = 0;
                last_seen = current;
            }

            if silent_ticks >= max_silent_ticks.max(1) {
                tracing::warn!("heartbeat timeout, aborting link");
                self.inner.link.abort("heartbeat timeout".into());
                self.teardown();
                return;
            }

            if self.inner.link.send(Packet::Ping).await.is_err() {
                self.teardown();
                return;
            }
        }
    }

    fn teardown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.channels.lock().clear();
    }

    /// Tear down the muxer and abort the underlying link because the peer
    /// violated the wire protocol (spec §9(b)).
    fn abort_protocol(&self, reason: String) {
        let err = MuxError::Protocol(reason);
        tracing::error!(error = %err, "aborting link on protocol violation");
        self.teardown();
        self.inner.link.abort(err.to_string());
    }

    /// Close the muxer and the underlying link. Idempotent.
    pub fn close(&self) {
        self.teardown();
        self.inner.link.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn open_channel_ids(&self) -> Vec<String> {
        self.inner.channels.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::mem_link::MemLink;

    #[tokio::test]
    async fn open_channel_completes_handshake_both_sides() {
        let (a, b) = MemLink::pair();
        let (muxer_a, _incoming_a) = Muxer::spawn(a, MuxerConfig::default(), ChannelConfig::default());
        let (muxer_b, mut incoming_b) = Muxer::spawn(b, MuxerConfig::default(), ChannelConfig::default());

        let (sender_a, _inbox_a) = muxer_a.open_channel("chat".into()).await;

        let incoming = incoming_b.recv().await.expect("peer should see the open");
        assert_eq!(incoming.channel_id, "chat");

        // Give the ack a moment to travel back to `a`.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sender_a.status(), crate::channel::ChannelStatus::Established);
    }

    #[tokio::test]
    async fn control_channel_double_open_is_not_a_collision() {
        // Both sides `open_channel(CONTROL_CHANNEL_ID)` independently, per
        // `Transport::connect`; receiving that back must still ack, not
        // abort.
        let (a, b) = MemLink::pair();
        let (muxer_a, _incoming_a) = Muxer::spawn(a, MuxerConfig::default(), ChannelConfig::default());
        let (muxer_b, _incoming_b) = Muxer::spawn(b, MuxerConfig::default(), ChannelConfig::default());

        let (sender_a, _inbox_a) = muxer_a.open_channel(CONTROL_CHANNEL_ID.to_string()).await;
        let (_sender_b, _inbox_b) = muxer_b.open_channel(CONTROL_CHANNEL_ID.to_string()).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sender_a.status(), crate::channel::ChannelStatus::Established);
        assert!(!muxer_a.is_closed());
        assert!(!muxer_b.is_closed());
    }

    #[tokio::test]
    async fn duplicate_stream_channel_id_aborts_the_link() {
        let (raw, link) = MemLink::pair();
        let (muxer, _incoming) = Muxer::spawn(link, MuxerConfig::default(), ChannelConfig::default());

        raw.send(Packet::OpenStream { channel_id: "dup".into() }).await.unwrap();
        // Drain the ack for the first, legitimate open.
        assert!(matches!(raw.recv().await.unwrap(), Packet::OpenStreamAck { .. }));

        raw.send(Packet::OpenStream { channel_id: "dup".into() }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(muxer.is_closed());
    }

    #[tokio::test]
    async fn data_flows_end_to_end() {
        let (a, b) = MemLink::pair();
        let (muxer_a, _incoming_a) = Muxer::spawn(a, MuxerConfig::default(), ChannelConfig::default());
        let (muxer_b, mut incoming_b) = Muxer::spawn(b, MuxerConfig::default(), ChannelConfig::default());

        let (sender_a, _inbox_a) = muxer_a.open_channel("data".into()).await;
        let mut incoming = incoming_b.recv().await.unwrap();

        sender_a.send(b"hello".to_vec()).await.unwrap();
        let got = incoming.inbox.recv().await.unwrap();
        assert_eq!(got, b"hello");
    }
}
