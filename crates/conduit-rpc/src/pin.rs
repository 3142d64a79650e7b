//! Pin feature: handle-valued remote references (spec §4.6).
//!
//! The owning side allocates a pin-id and keeps the real value behind a
//! [`PinTarget`]; the peer gets a [`WireValue::Placeholder`] of kind
//! `"pin"` and builds a [`PinProxy`] whose calls become `__pin_call__/<id>/
//! <method>` RPCs. `release{pin_id}` notifications (sent when a proxy
//! drops) decrement the refcount; at zero the local entry is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::call_executor::Environment;
use crate::call_manager::CallManager;
use crate::error::RpcError;
use crate::messages::{PinId, RpcMessage};
use crate::wire::WireValue;

pub const PIN_KIND: &str = "pin";
pub const PIN_CALL_PREFIX: &str = "__pin_call__/";

/// A locally-owned value reachable through a pin. Implement this for
/// anything you want to hand a remote peer a reference to.
#[async_trait]
pub trait PinTarget: Send + Sync {
    async fn call(&self, method: &str, args: Vec<WireValue>, env: &Environment) -> Result<WireValue, RpcError>;
}

struct Entry {
    target: Arc<dyn PinTarget>,
    refcount: usize,
}

/// The owning side's pin table: `{id -> {value, refcount}}` (spec §4.6,
/// §GLOSSARY "Pin").
#[derive(Default)]
pub struct PinRegistry {
    entries: Mutex<HashMap<PinId, Entry>>,
    next_id: AtomicU64,
}

impl PinRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a pin-id for `target`, set its refcount to 1, and return the
    /// placeholder to send the peer.
    pub fn pin(&self, target: Arc<dyn PinTarget>) -> WireValue {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(id, Entry { target, refcount: 1 });
        WireValue::placeholder(PIN_KIND, id)
    }

    /// Bump the refcount of an existing entry by `extra`, used when a
    /// placeholder referencing it is cloned for fan-out to several peers.
    /// No-op if the id is unknown.
    pub fn bump_refcount(&self, pin_id: PinId, extra: usize) {
        if let Some(entry) = self.entries.lock().get_mut(&pin_id) {
            entry.refcount += extra;
        }
    }

    /// Handle a `release{pin_id}` notification from the peer.
    pub fn release(&self, pin_id: PinId) {
        let mut entries = self.entries.lock();
        let drop_it = match entries.get_mut(&pin_id) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if drop_it {
            entries.remove(&pin_id);
            tracing::debug!(pin_id, "pin refcount reached zero, entry dropped");
        }
    }

    pub fn resolve(&self, pin_id: PinId) -> Option<Arc<dyn PinTarget>> {
        self.entries.lock().get(&pin_id).map(|e| Arc::clone(&e.target))
    }

    /// Parse a `__pin_call__/<id>/<method>` path.
    pub fn parse_call_path(path: &str) -> Option<(PinId, &str)> {
        let rest = path.strip_prefix(PIN_CALL_PREFIX)?;
        let (id_str, method) = rest.split_once('/')?;
        let id = id_str.parse().ok()?;
        Some((id, method))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The holder side's proxy: every call becomes an RPC `ask`; dropping it
/// sends `release{pin_id}` so the owner can free the entry.
pub struct PinProxy {
    pin_id: PinId,
    call_manager: Arc<CallManager>,
    released: std::sync::atomic::AtomicBool,
}

impl PinProxy {
    pub fn new(pin_id: PinId, call_manager: Arc<CallManager>) -> Self {
        Self {
            pin_id,
            call_manager,
            released: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn pin_id(&self) -> PinId {
        self.pin_id
    }

    pub async fn call(&self, method: &str, args: Vec<WireValue>) -> Result<WireValue, RpcError> {
        let path = format!("{PIN_CALL_PREFIX}{}/{method}", self.pin_id);
        self.call_manager.ask(path, args, vec![]).await
    }

    /// Explicitly release the pin (idempotent). Also happens implicitly on
    /// drop, best-effort, since `Drop` cannot await.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .call_manager
            .control_sender()
            .send(RpcMessage::Release { pin_id: self.pin_id }.encode())
            .await;
    }
}

impl Drop for PinProxy {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let control = self.call_manager.control_sender().clone();
        let pin_id = self.pin_id;
        tokio::spawn(async move {
            let _ = control.send(RpcMessage::Release { pin_id }.encode()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl PinTarget for Echo {
        async fn call(&self, method: &str, args: Vec<WireValue>, _env: &Environment) -> Result<WireValue, RpcError> {
            Ok(WireValue::Str(format!("{method}:{args:?}")))
        }
    }

    #[test]
    fn pin_and_release_refcounting() {
        let registry = PinRegistry::new();
        let placeholder = registry.pin(Arc::new(Echo));
        let id = match placeholder {
            WireValue::Placeholder(p) => p.id,
            _ => unreachable!(),
        };
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(id).is_some());

        registry.release(id);
        assert_eq!(registry.len(), 0);
        assert!(registry.resolve(id).is_none());
    }

    #[test]
    fn bump_refcount_delays_release_until_every_holder_releases() {
        let registry = PinRegistry::new();
        let placeholder = registry.pin(Arc::new(Echo));
        let id = match placeholder {
            WireValue::Placeholder(p) => p.id,
            _ => unreachable!(),
        };
        registry.bump_refcount(id, 2); // now 3 holders total
        registry.release(id);
        registry.release(id);
        assert!(registry.resolve(id).is_some());
        registry.release(id);
        assert!(registry.resolve(id).is_none());
    }

    #[test]
    fn parses_pin_call_path() {
        assert_eq!(
            PinRegistry::parse_call_path("__pin_call__/42/greet"),
            Some((42, "greet"))
        );
        assert_eq!(PinRegistry::parse_call_path("echo"), None);
    }
}
