//! Call Manager: the client side of `ask`/`tell` (spec §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conduit_core::ChannelSender;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::messages::{CallId, CallKind, RpcMessage};
use crate::wire::WireValue;
use crate::RpcConfig;

struct Pending {
    resolve: oneshot::Sender<Result<WireValue, RpcError>>,
}

/// Client-side call tracking: allocates `call_id`s, serializes requests onto
/// the control channel, and routes matching responses back to their caller.
///
/// A `CallManager` does not itself read the control channel -- the owning
/// session's read loop calls [`CallManager::handle_message`] as messages
/// arrive, since the same control channel also carries executor-bound
/// requests.
pub struct CallManager {
    control: ChannelSender,
    config: RpcConfig,
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<CallId, Pending>>,
}

impl CallManager {
    pub fn new(control: ChannelSender, config: RpcConfig) -> Arc<Self> {
        Arc::new(Self {
            control,
            config,
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn control_sender(&self) -> &ChannelSender {
        &self.control
    }

    fn allocate_call_id(&self) -> CallId {
        self.next_call_id.fetch_add(1, Ordering::SeqCst)
    }

    /// `ask(path, args, meta)` -> value or error (spec §4.5). Suspends until
    /// a matching response arrives, the link closes, or `call_timeout`
    /// elapses.
    pub async fn ask(
        &self,
        path: impl Into<String>,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) -> Result<WireValue, RpcError> {
        let call_id = self.allocate_call_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id, Pending { resolve: tx });

        let request = RpcMessage::Request {
            call_id,
            kind: CallKind::Ask,
            path: path.into(),
            input,
            meta,
        };
        if let Err(e) = self.control.send(request.encode()).await {
            self.pending.lock().remove(&call_id);
            return Err(RpcError::from(e));
        }

        let result = tokio::time::timeout(self.config.call_timeout, rx).await;
        match result {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(_recv_error)) => Err(RpcError::LinkClosed),
            Err(_elapsed) => {
                self.pending.lock().remove(&call_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// `tell(path, args, meta)`: fire-and-forget, no response tracked.
    pub async fn tell(
        &self,
        path: impl Into<String>,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) -> Result<(), RpcError> {
        let request = RpcMessage::Request {
            call_id: self.allocate_call_id(),
            kind: CallKind::Tell,
            path: path.into(),
            input,
            meta,
        };
        self.control.send(request.encode()).await.map_err(RpcError::from)
    }

    /// Route one control-channel message destined for this manager.
    /// Returns `true` if it was handled (a response); `false` means it
    /// belongs to the executor (a request or introspection call).
    pub fn handle_message(&self, message: &RpcMessage) -> bool {
        if let RpcMessage::Response { call_id, result } = message {
            if let Some(pending) = self.pending.lock().remove(call_id) {
                let translated = result
                    .clone()
                    .map_err(RpcError::Remote);
                let _ = pending.resolve.send(translated);
                return true;
            }
        }
        false
    }

    /// Reject every pending call; called when the underlying link closes
    /// (spec §4.5: "On link close: reject all pending with a
    /// connection-closed error").
    pub fn reject_all_pending(&self) {
        let mut pending = self.pending.lock();
        for (_, p) in pending.drain() {
            let _ = p.resolve.send(Err(RpcError::LinkClosed));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
