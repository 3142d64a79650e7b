//! Per-channel sliding-window reliability (spec §3, §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::config::{ChannelConfig, PRE_HANDSHAKE_WINDOW_SIZE};
use crate::error::MuxError;
use crate::link::DynLink;
use crate::packet::{Packet, Seq};

/// Handshake status of a channel (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The channel has not yet completed its open/ack handshake. The
    /// sender's effective window is clamped to [`PRE_HANDSHAKE_WINDOW_SIZE`].
    PreHandshake,
    /// The handshake completed; the full configured window applies.
    Established,
}

struct InFlightEntry {
    payload: Vec<u8>,
}

struct SenderInner {
    channel_id: String,
    link: DynLink,
    config: ChannelConfig,
    next_seq: AtomicU64,
    in_flight: Mutex<HashMap<Seq, InFlightEntry>>,
    window: Arc<Semaphore>,
    status: Mutex<ChannelStatus>,
    closed: AtomicBool,
    closed_notify: Notify,
}

/// Sender half of a channel's sliding-window reliability.
///
/// `send` suspends when the in-flight window is full (spec §5: "MUX sender
/// `send(payload)` suspends when the in-flight window is full, resuming on
/// ack or link close").
#[derive(Clone)]
pub struct ChannelSender {
    inner: Arc<SenderInner>,
}

impl ChannelSender {
    pub(crate) fn new(channel_id: String, link: DynLink, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                channel_id,
                link,
                config,
                next_seq: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                // Clamp to the configured window so a `window_size` below
                // the pre-handshake default can't let the effective window
                // stay stuck above it once established (spec §3, §8 `max
                // in_flight(c) <= effective_window(c)`).
                window: Arc::new(Semaphore::new(PRE_HANDSHAKE_WINDOW_SIZE.min(config.window_size))),
                status: Mutex::new(ChannelStatus::PreHandshake),
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.lock()
    }

    /// Transition to [`ChannelStatus::Established`], raising the effective
    /// window to the configured size (spec §4.2 handshake).
    pub(crate) fn mark_established(&self) {
        let mut status = self.inner.status.lock();
        if *status == ChannelStatus::Established {
            return;
        }
        *status = ChannelStatus::Established;
        let extra = self
            .inner
            .config
            .window_size
            .saturating_sub(PRE_HANDSHAKE_WINDOW_SIZE);
        if extra > 0 {
            self.inner.window.add_permits(extra);
        }
    }

    /// Enqueue `payload` for reliable delivery. Suspends while the window is
    /// full; returns once the packet has been handed to the link (not once
    /// it has been acknowledged).
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = tokio::select! {
            p = Arc::clone(&self.inner.window).acquire_owned() => p,
            _ = self.inner.closed_notify.notified() => return Err(self.closed_error()),
        };
        let permit = permit.expect("channel semaphore is never closed directly");
        permit.forget();

        if self.is_closed() {
            // Closed while we were waiting for the window; give the permit
            // back conceptually by simply not retransmitting.
            return Err(self.closed_error());
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        self.inner
            .in_flight
            .lock()
            .insert(seq, InFlightEntry { payload: payload.clone() });

        self.transmit(seq, payload.clone()).await?;
        self.spawn_retry(seq);
        Ok(())
    }

    async fn transmit(&self, seq: Seq, payload: Vec<u8>) -> Result<(), MuxError> {
        self.inner
            .link
            .send(Packet::Data {
                channel_id: self.inner.channel_id.clone(),
                seq,
                payload,
            })
            .await
            .map_err(MuxError::from)
    }

    fn spawn_retry(&self, seq: Seq) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.config.ack_timeout).await;
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                let payload = {
                    let guard = inner.in_flight.lock();
                    match guard.get(&seq) {
                        Some(entry) => entry.payload.clone(),
                        None => return, // acknowledged
                    }
                };
                tracing::debug!(channel_id = %inner.channel_id, seq, "retransmitting unacked packet");
                let res = inner
                    .link
                    .send(Packet::Data {
                        channel_id: inner.channel_id.clone(),
                        seq,
                        payload,
                    })
                    .await;
                if res.is_err() {
                    return;
                }
            }
        });
    }

    /// Process an incoming `ack(seq)`: remove it from the in-flight map and
    /// free up a window slot.
    pub(crate) fn handle_ack(&self, ack_seq: Seq) {
        let removed = self.inner.in_flight.lock().remove(&ack_seq).is_some();
        if removed {
            self.inner.window.add_permits(1);
        }
    }

    /// Number of packets currently unacknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Local close: stop accepting writes and send `close-channel`. Idempotent.
    pub async fn close(&self, reason: Option<String>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.closed_notify.notify_waiters();
        let _ = self
            .inner
            .link
            .send(Packet::CloseChannel {
                channel_id: self.inner.channel_id.clone(),
                reason,
            })
            .await;
    }

    fn closed_error(&self) -> MuxError {
        MuxError::ChannelClosed {
            channel_id: self.inner.channel_id.clone(),
            reason: None,
        }
    }
}

/// Receiver half of a channel's sliding-window reliability.
pub struct ChannelReceiver {
    channel_id: String,
    link: DynLink,
    next_expected_seq: u64,
    buffer: Vec<Option<Vec<u8>>>,
    buffer_size: usize,
    delivered_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Consumer-facing half returned alongside [`ChannelReceiver`]; `recv`
/// suspends until the next in-order payload is delivered or the channel
/// closes.
pub struct ChannelInbox {
    delivered_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelInbox {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.delivered_rx.recv().await
    }
}

impl ChannelReceiver {
    pub(crate) fn new(channel_id: String, link: DynLink, config: ChannelConfig) -> (Self, ChannelInbox) {
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let this = Self {
            channel_id,
            link,
            next_expected_seq: 0,
            buffer: vec![None; config.receive_buffer_size],
            buffer_size: config.receive_buffer_size,
            delivered_tx,
        };
        (this, ChannelInbox { delivered_rx })
    }

    /// Handle an incoming `data(seq, payload)` per the receiver algorithm in
    /// spec §4.2.
    pub async fn on_data(&mut self, seq: Seq, payload: Vec<u8>) {
        // 1. Ack immediately, idempotent from the sender's point of view.
        let _ = self
            .link
            .send(Packet::Ack {
                channel_id: self.channel_id.clone(),
                ack_seq: seq,
            })
            .await;

        // 2. Duplicate: already delivered.
        if seq < self.next_expected_seq {
            tracing::debug!(channel_id = %self.channel_id, seq, "dropping duplicate data packet");
            return;
        }

        // 3. Out of window.
        if seq >= self.next_expected_seq + self.buffer_size as u64 {
            tracing::warn!(
                channel_id = %self.channel_id,
                seq,
                next_expected = self.next_expected_seq,
                "dropping out-of-window data packet"
            );
            return;
        }

        // 4. Place in slot (collision => duplicate).
        let slot = (seq % self.buffer_size as u64) as usize;
        if self.buffer[slot].is_some() && seq != self.next_expected_seq {
            // A different, not-yet-delivered seq already occupies this slot;
            // spec treats this as a duplicate.
            tracing::debug!(channel_id = %self.channel_id, seq, "dropping slot-collision data packet");
            return;
        }
        self.buffer[slot] = Some(payload);

        // 5. Walk forward delivering contiguous slots.
        loop {
            let slot = (self.next_expected_seq % self.buffer_size as u64) as usize;
            match self.buffer[slot].take() {
                Some(p) => {
                    self.next_expected_seq += 1;
                    if self.delivered_tx.send(p).is_err() {
                        return; // consumer dropped
                    }
                }
                None => break,
            }
        }
    }

    pub fn next_expected_seq(&self) -> Seq {
        self.next_expected_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_support::NullLink;

    fn config() -> ChannelConfig {
        ChannelConfig {
            window_size: 4,
            receive_buffer_size: 4,
            ack_timeout: std::time::Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn sender_window_limits_in_flight() {
        let link = NullLink::new();
        let sender = ChannelSender::new("c1".into(), link, ChannelConfig {
            window_size: 2,
            receive_buffer_size: 2,
            ack_timeout: std::time::Duration::from_secs(60),
        });
        sender.mark_established();

        sender.send(vec![1]).await.unwrap();
        sender.send(vec![2]).await.unwrap();
        assert_eq!(sender.in_flight_count(), 2);

        // Third send should suspend until an ack frees a slot.
        let sender2 = sender.clone();
        let handle = tokio::spawn(async move { sender2.send(vec![3]).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        sender.handle_ack(0);
        handle.await.unwrap().unwrap();
        assert_eq!(sender.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn receiver_delivers_in_order_despite_reordering() {
        let link = NullLink::new();
        let (mut recv, mut inbox) = ChannelReceiver::new("c1".into(), link, config());

        recv.on_data(1, vec![1]).await;
        recv.on_data(2, vec![2]).await;
        // Nothing delivered yet: seq 0 missing.
        recv.on_data(0, vec![0]).await;

        assert_eq!(inbox.recv().await, Some(vec![0]));
        assert_eq!(inbox.recv().await, Some(vec![1]));
        assert_eq!(inbox.recv().await, Some(vec![2]));
        assert_eq!(recv.next_expected_seq(), 3);
    }

    #[tokio::test]
    async fn receiver_drops_duplicate() {
        let link = NullLink::new();
        let (mut recv, mut inbox) = ChannelReceiver::new("c1".into(), link, config());

        recv.on_data(0, vec![0]).await;
        assert_eq!(inbox.recv().await, Some(vec![0]));

        recv.on_data(0, vec![0]).await; // duplicate, discarded
        assert_eq!(recv.next_expected_seq(), 1);
    }

    #[tokio::test]
    async fn receiver_drops_out_of_window() {
        let link = NullLink::new();
        let (mut recv, _inbox) = ChannelReceiver::new(
            "c1".into(),
            link,
            ChannelConfig {
                window_size: 4,
                receive_buffer_size: 4,
                ack_timeout: std::time::Duration::from_secs(1),
            },
        );

        recv.on_data(10, vec![10]).await; // way beyond window
        assert_eq!(recv.next_expected_seq(), 0);
    }

    #[tokio::test]
    async fn sender_close_is_idempotent() {
        let link = NullLink::new();
        let sender = ChannelSender::new("c1".into(), link, config());
        sender.close(Some("bye".into())).await;
        sender.close(Some("bye again".into())).await;
        assert!(sender.is_closed());
        assert_eq!(
            sender.send(vec![1]).await,
            Err(MuxError::ChannelClosed {
                channel_id: "c1".into(),
                reason: None
            })
        );
    }

    #[tokio::test]
    async fn unacked_packet_is_retransmitted() {
        let link = NullLink::new();
        let sender = ChannelSender::new(
            "c1".into(),
            link,
            ChannelConfig {
                window_size: 4,
                receive_buffer_size: 4,
                ack_timeout: std::time::Duration::from_millis(20),
            },
        );
        sender.mark_established();
        sender.send(vec![9]).await.unwrap();
        // Give the retry task a couple of chances to fire; it should not panic
        // and the packet should still be in flight (no ack received).
        tokio::time::sleep(std::time::Duration::from_millis(70)).await;
        assert_eq!(sender.in_flight_count(), 1);
    }
}
