//! Call Executor: the server side of `ask`/`tell` (spec §4.5).
//!
//! Handlers are registered against a path (e.g. `"echo"` or
//! `"users/create"`); the router itself is flat (a `HashMap`), but paths
//! are free to encode hierarchy the way the teacher's
//! `ServiceRegistry` encodes `service/method` pairs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_core::ChannelSender;

use crate::error::RpcError;
use crate::messages::{CallKind, MethodDescriptor, MethodKind, RpcMessage};
use crate::wire::WireValue;

/// Per-call context handed to a handler (spec §6 "RPC handler contract").
#[derive(Clone)]
pub struct Environment {
    /// Transport-supplied context; `None` when the transport has none.
    pub ctx: Option<WireValue>,
    /// Ordered system-then-user context objects accompanying the call.
    pub meta: Vec<WireValue>,
    closing: Arc<AtomicBool>,
}

impl Environment {
    pub fn new(ctx: Option<WireValue>, meta: Vec<WireValue>, closing: Arc<AtomicBool>) -> Self {
        Self { ctx, meta, closing }
    }

    /// Cooperative-cancellation check: handlers may voluntarily
    /// short-circuit when this returns `true` (spec §4.5 "Cancellation").
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<WireValue, RpcError>> + Send>>;
pub type Handler = Arc<dyn Fn(Environment, Vec<WireValue>) -> HandlerFuture + Send + Sync>;

struct Registration {
    handler: Handler,
    kind: MethodKind,
}

/// Server-side router plus introspection metadata, and the code that turns
/// incoming `rpc-request`/`notify` messages into handler invocations and
/// (for `ask`) `rpc-response` messages.
pub struct CallExecutor {
    control: ChannelSender,
    routes: HashMap<String, Registration>,
    closing: Arc<AtomicBool>,
    pin_registry: Option<Arc<crate::pin::PinRegistry>>,
}

impl CallExecutor {
    pub fn new(control: ChannelSender) -> Self {
        Self {
            control,
            routes: HashMap::new(),
            closing: Arc::new(AtomicBool::new(false)),
            pin_registry: None,
        }
    }

    /// Register a handler at `path` with the given streaming shape.
    pub fn register(&mut self, path: impl Into<String>, kind: MethodKind, handler: Handler) {
        self.routes.insert(path.into(), Registration { handler, kind });
    }

    /// Route `__pin_call__/<id>/<method>` requests and `release{pin_id}`
    /// notifications to `registry` (spec §4.6 "Pin").
    pub fn set_pin_registry(&mut self, registry: Arc<crate::pin::PinRegistry>) {
        self.pin_registry = Some(registry);
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Handle one `rpc-request`/`notify`/introspection message. Returns
    /// `true` if this executor owned the message.
    pub async fn handle_message(&self, message: RpcMessage) -> bool {
        match message {
            RpcMessage::Request {
                call_id,
                kind,
                path,
                input,
                meta,
            } => {
                self.dispatch(call_id, kind, path, input, meta).await;
                true
            }
            RpcMessage::Release { pin_id } => {
                if let Some(registry) = &self.pin_registry {
                    registry.release(pin_id);
                }
                true
            }
            RpcMessage::ListServices { call_id } => {
                let mut services: Vec<String> = self.routes.keys().cloned().collect();
                services.sort();
                let _ = self
                    .control
                    .send(
                        RpcMessage::ListServicesResponse { call_id, services }.encode(),
                    )
                    .await;
                true
            }
            RpcMessage::GetService { call_id, path } => {
                let methods = self.routes.get(&path).map(|r| {
                    vec![MethodDescriptor {
                        name: path.clone(),
                        kind: r.kind,
                    }]
                });
                let _ = self
                    .control
                    .send(RpcMessage::GetServiceResponse { call_id, methods }.encode())
                    .await;
                true
            }
            _ => false,
        }
    }

    async fn dispatch(
        &self,
        call_id: crate::messages::CallId,
        kind: CallKind,
        path: String,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) {
        let env = Environment::new(None, meta, Arc::clone(&self.closing));

        let result = if let Some((pin_id, method)) = crate::pin::PinRegistry::parse_call_path(&path) {
            match self.pin_registry.as_ref().and_then(|r| r.resolve(pin_id)) {
                Some(target) => target.call(method, input, &env).await,
                None => Err(RpcError::UnknownHandle { kind: "pin", id: pin_id }),
            }
        } else {
            match self.routes.get(&path) {
                Some(reg) => (reg.handler)(env, input).await,
                None => Err(RpcError::ProcedureNotFound(path)),
            }
        };

        if kind == CallKind::Tell {
            if let Err(e) = result {
                tracing::error!(call_id, error = %e, "unhandled error in tell handler");
            }
            return;
        }

        let wire_result = result.map_err(|e| e.to_string());
        let _ = self
            .control
            .send(
                RpcMessage::Response {
                    call_id,
                    result: wire_result,
                }
                .encode(),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{ChannelConfig, MemLink, MuxerConfig, Transport};

    fn echo_handler() -> Handler {
        Arc::new(|_env, input| {
            Box::pin(async move { Ok(input.into_iter().next().unwrap_or(WireValue::Null)) })
        })
    }

    #[tokio::test]
    async fn dispatches_ask_and_sends_response() {
        let (a, b) = MemLink::pair();
        let ta = Transport::connect(a, MuxerConfig::default(), ChannelConfig::default()).await;
        let tb = Transport::connect(b, MuxerConfig::default(), ChannelConfig::default()).await;

        let mut executor = CallExecutor::new(tb.control_sender().clone());
        executor.register("echo", MethodKind::Unary, echo_handler());

        ta.control_sender()
            .send(
                RpcMessage::Request {
                    call_id: 1,
                    kind: CallKind::Ask,
                    path: "echo".into(),
                    input: vec![WireValue::Str("hi".into())],
                    meta: vec![],
                }
                .encode(),
            )
            .await
            .unwrap();

        let request_bytes = tb.control_recv().await.unwrap();
        let handled = executor
            .handle_message(RpcMessage::decode(&request_bytes).unwrap())
            .await;
        assert!(handled);

        let response_bytes = ta.control_recv().await.unwrap();
        match RpcMessage::decode(&response_bytes).unwrap() {
            RpcMessage::Response { call_id, result } => {
                assert_eq!(call_id, 1);
                assert_eq!(result, Ok(WireValue::Str("hi".into())));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_procedure_is_reported_to_caller() {
        let (_a, b) = MemLink::pair();
        let tb = Transport::connect(b, MuxerConfig::default(), ChannelConfig::default()).await;
        let executor = CallExecutor::new(tb.control_sender().clone());

        executor
            .dispatch(5, CallKind::Ask, "missing".into(), vec![], vec![])
            .await;
        let response_bytes = tb.control_recv().await.unwrap();
        match RpcMessage::decode(&response_bytes).unwrap() {
            RpcMessage::Response { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tell_never_produces_a_response() {
        let (a, b) = MemLink::pair();
        let ta = Transport::connect(a, MuxerConfig::default(), ChannelConfig::default()).await;
        let tb = Transport::connect(b, MuxerConfig::default(), ChannelConfig::default()).await;

        let mut executor = CallExecutor::new(tb.control_sender().clone());
        executor.register("echo", MethodKind::Unary, echo_handler());

        executor
            .dispatch(9, CallKind::Tell, "echo".into(), vec![WireValue::Null], vec![])
            .await;

        // Nothing should show up on the control channel.
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), ta.control_recv()).await;
        assert!(result.is_err(), "tell must never produce a response");
    }
}
