//! BUS error taxonomy (spec §7).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum BusError {
    /// No local or routed node matches the destination id.
    NodeNotFound(String),
    /// The node exists but its API hasn't been registered yet.
    ProcedureNotReady(String),
    /// The destination node is draining and refuses new `ask`s.
    NodeClosing(String),
    /// A reliable control-plane request (`handshake`, `sub-update`,
    /// `node-announcement`) did not get an ack within its timeout.
    Timeout,
    /// Propagated from the RPC layer underneath a bridge.
    Rpc(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::NodeNotFound(id) => write!(f, "node {id} not found"),
            BusError::ProcedureNotReady(id) => write!(f, "node {id} has no registered api yet"),
            BusError::NodeClosing(id) => write!(f, "node {id} is closing"),
            BusError::Timeout => write!(f, "control-plane request timed out"),
            BusError::Rpc(msg) => write!(f, "rpc error: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<conduit_rpc::RpcError> for BusError {
    fn from(e: conduit_rpc::RpcError) -> Self {
        BusError::Rpc(e.to_string())
    }
}
