//! `conduit-rpc`: request/response and fire-and-forget procedures over a
//! `conduit-core` transport, plus the pin and stream features.

pub mod call_executor;
pub mod call_manager;
pub mod config;
pub mod error;
pub mod messages;
pub mod pin;
pub mod session;
pub mod stream;
pub mod wire;

pub use call_executor::{CallExecutor, Environment, Handler, HandlerFuture};
pub use call_manager::CallManager;
pub use config::RpcConfig;
pub use error::RpcError;
pub use messages::{CallId, CallKind, MethodDescriptor, MethodKind, PinId, RpcMessage};
pub use pin::{PinProxy, PinRegistry, PinTarget, PIN_KIND};
pub use session::RpcSession;
pub use stream::{StreamReader, StreamWriter};
pub use wire::{Placeholder, TypeHandler, TypeHandlerRegistry, WireValue};
