//! Correlates outgoing `handshake`/`sub-update`/`node-announcement`
//! requests with their acks (spec §4.8, §4.9), mirroring the
//! request/response bookkeeping `conduit_rpc::CallManager` does for RPC
//! calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::messages::CorrelationId;

struct Pending<T> {
    resolve: oneshot::Sender<T>,
}

/// Tracks in-flight correlation ids for one bridge link and resolves or
/// times out the waiter for each.
pub struct PendingAckManager<T> {
    config: BusConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, Pending<T>>>,
}

impl<T: Send + 'static> PendingAckManager<T> {
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a fresh correlation id and register a waiter for it.
    pub fn begin(&self) -> (CorrelationId, oneshot::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, Pending { resolve: tx });
        (id, rx)
    }

    /// Resolve the waiter for `correlation_id`, if still pending.
    pub fn resolve(&self, correlation_id: CorrelationId, value: T) {
        if let Some(pending) = self.pending.lock().remove(&correlation_id) {
            let _ = pending.resolve.send(value);
        }
    }

    /// Await the ack for `correlation_id`, bounded by `bridge_ack_timeout`.
    pub async fn wait(&self, correlation_id: CorrelationId, rx: oneshot::Receiver<T>) -> Result<T, BusError> {
        match tokio::time::timeout(self.config.bridge_ack_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BusError::Timeout),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(BusError::Timeout)
            }
        }
    }

    /// Resolve every pending waiter as if it had timed out: used when the
    /// underlying bridge disconnects so no caller hangs forever.
    pub fn fail_all(&self) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, pending) in waiters {
            drop(pending.resolve);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_completes_the_waiter() {
        let manager: Arc<PendingAckManager<u32>> = PendingAckManager::new(BusConfig::default());
        let (id, rx) = manager.begin();
        manager.resolve(id, 42);
        assert_eq!(manager.wait(id, rx).await, Ok(42));
    }

    #[tokio::test]
    async fn unresolved_waiter_times_out() {
        let config = BusConfig {
            bridge_ack_timeout: Duration::from_millis(20),
        };
        let manager: Arc<PendingAckManager<u32>> = PendingAckManager::new(config);
        let (id, rx) = manager.begin();
        assert_eq!(manager.wait(id, rx).await, Err(BusError::Timeout));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_drops_every_waiter() {
        let manager: Arc<PendingAckManager<u32>> = PendingAckManager::new(BusConfig::default());
        let (id1, rx1) = manager.begin();
        let (_id2, rx2) = manager.begin();
        manager.fail_all();
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
        assert_eq!(manager.pending_count(), 0);
        let _ = id1;
    }
}
