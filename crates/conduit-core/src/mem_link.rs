//! In-memory [`Link`] implementation for tests and single-process demos,
//! grounded on the teacher's in-process transport (`transport/mem.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::LinkError;
use crate::link::{DynLink, Link};
use crate::packet::Packet;

/// A [`Link`] backed by a pair of in-process `mpsc` channels. Use
/// [`MemLink::pair`] to build both ends of a duplex connection.
#[derive(Debug)]
pub struct MemLink {
    tx: mpsc::UnboundedSender<Packet>,
    rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: AtomicBool,
}

impl MemLink {
    /// Build a connected pair: packets sent on one side arrive on the other.
    pub fn pair() -> (DynLink, DynLink) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();

        let a = Arc::new(MemLink {
            tx: tx_a,
            rx: Mutex::new(rx_a),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(MemLink {
            tx: tx_b,
            rx: Mutex::new(rx_b),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }
}

#[async_trait]
impl Link for MemLink {
    async fn send(&self, packet: Packet) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.tx.send(packet).map_err(|_| LinkError::Closed)
    }

    async fn recv(&self) -> Result<Packet, LinkError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(packet) => Ok(packet),
            None => {
                self.closed.store(true, Ordering::Release);
                Err(LinkError::Closed)
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_both_directions() {
        let (a, b) = MemLink::pair();
        a.send(Packet::Ping).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Packet::Ping);

        b.send(Packet::Pong).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Packet::Pong);
    }

    #[tokio::test]
    async fn closing_one_end_fails_recv_on_the_other() {
        let (a, b) = MemLink::pair();
        a.close();
        assert_eq!(a.send(Packet::Ping).await, Err(LinkError::Closed));
        // Dropping `a` drops its sender half, which ends `b`'s stream.
        drop(a);
        assert_eq!(b.recv().await, Err(LinkError::Closed));
    }
}
