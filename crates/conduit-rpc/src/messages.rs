//! Control-channel message envelope (spec §4.5, §6).
//!
//! Each [`RpcMessage`] is postcard-encoded and sent as one
//! `ChannelSender::send` call; `conduit-core`'s [`Packet::Data`] already
//! preserves payload boundaries, so no extra length-prefix framing is
//! needed on top (unlike [`conduit_core::FramedLink`], which frames an
//! otherwise-boundary-less byte stream).

use serde::{Deserialize, Serialize};

use crate::wire::WireValue;

pub type CallId = u64;
pub type PinId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// `ask` or `tell` request.
    Request {
        call_id: CallId,
        kind: CallKind,
        path: String,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    },
    /// Response to an `ask` request.
    Response {
        call_id: CallId,
        result: Result<WireValue, String>,
    },
    /// Pin refcount decrement.
    Release { pin_id: PinId },
    /// Introspection: list registered service paths.
    ListServices { call_id: CallId },
    ListServicesResponse {
        call_id: CallId,
        services: Vec<String>,
    },
    /// Introspection: describe one service's methods.
    GetService { call_id: CallId, path: String },
    GetServiceResponse {
        call_id: CallId,
        methods: Option<Vec<MethodDescriptor>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    Ask,
    Tell,
}

/// Streaming shape of one registered method, mirrored from the teacher's
/// `MethodKind` (spec-additive introspection surface, SPEC_FULL.md §RPC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidirectional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: MethodKind,
}

impl RpcMessage {
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("RpcMessage encoding is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
