//! RPC error taxonomy (spec §7).

use std::fmt;

/// Errors surfaced to RPC callers and handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The link closed while a call was outstanding; all pending calls are
    /// rejected with this on connection loss.
    LinkClosed,
    /// No response arrived within the call's timeout.
    Timeout,
    /// The remote handler returned a structured error (its message is
    /// preserved verbatim; no remote stack trace crosses the wire).
    Remote(String),
    /// Something went wrong locally before the request ever reached the
    /// wire: serialization failure, unknown placeholder kind, bad path.
    Local(String),
    /// No handler is registered for the requested path.
    ProcedureNotFound(String),
    /// A placeholder referenced a `kind` with no registered type handler.
    UnknownPlaceholderKind(String),
    /// A pin or stream id referenced by a placeholder has no local entry
    /// (already released, or never existed).
    UnknownHandle { kind: &'static str, id: u64 },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::LinkClosed => write!(f, "link closed"),
            RpcError::Timeout => write!(f, "rpc call timed out"),
            RpcError::Remote(msg) => write!(f, "remote error: {msg}"),
            RpcError::Local(msg) => write!(f, "local error: {msg}"),
            RpcError::ProcedureNotFound(path) => write!(f, "no procedure registered at {path}"),
            RpcError::UnknownPlaceholderKind(kind) => {
                write!(f, "no type handler registered for placeholder kind {kind}")
            }
            RpcError::UnknownHandle { kind, id } => write!(f, "unknown {kind} handle {id}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<conduit_core::MuxError> for RpcError {
    fn from(e: conduit_core::MuxError) -> Self {
        match e {
            conduit_core::MuxError::LinkClosed | conduit_core::MuxError::ChannelClosed { .. } => {
                RpcError::LinkClosed
            }
            other => RpcError::Local(other.to_string()),
        }
    }
}
