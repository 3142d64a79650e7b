//! `conduit`: a layered MUX/RPC/BUS communication substrate, plus a
//! dependency resolver for the nodes that sit on top of it.
//!
//! The three layers compose bottom-up:
//!
//! - [`conduit_core`] (the MUX layer) carries reliable multiplexed
//!   channels over an abstract duplex [`Link`].
//! - [`conduit_rpc`] (the RPC layer) runs request/response and
//!   fire-and-forget calls, pins, and streams over a MUX [`Transport`].
//! - [`conduit_bus`] (the BUS layer) federates a tree of [`Bus`]es that
//!   route point-to-point calls and fan out pub/sub broadcasts across
//!   bridges.
//!
//! [`conduit_resolver`] is the fourth, independent piece: a backtracking
//! dependency resolver and graph diff/plan engine, unrelated to wire
//! transport but sharing this crate's error-handling conventions.

// Re-export the MUX layer.
pub use conduit_core::{
    ChannelConfig, ChannelInbox, ChannelReceiver, ChannelSender, ChannelStatus, DynLink, FramedLink, IncomingChannel,
    Link, LinkError, MemLink, MuxError, Muxer, MuxerConfig, Packet, Seq, Transport, CONTROL_CHANNEL_ID,
};

// Re-export the RPC layer.
pub use conduit_rpc::{
    CallExecutor, CallId, CallKind, CallManager, Environment, Handler, HandlerFuture, MethodDescriptor, MethodKind,
    PinId, PinProxy, PinRegistry, PinTarget, Placeholder, RpcConfig, RpcError, RpcMessage, RpcSession, StreamReader,
    StreamWriter, TypeHandler, TypeHandlerRegistry, WireValue, PIN_KIND,
};

// Re-export the BUS layer. `CallId` is the same `u64` alias in both
// `conduit_rpc` and `conduit_bus`, so the bus one is left reachable only
// via `conduit_bus::CallId` to avoid a duplicate top-level name.
pub use conduit_bus::{
    AnnounceOp, AskSession, Bus, BusConfig, BusError, BusId, BusMessage, BridgeCoordinator, CorrelationId, Dispatcher,
    Inbound, LocalNodeManager, NextHop, NodeId, P2pPayload, BroadcastPayload, PendingAckManager, RoutingTable, SubOp,
    Topic,
};
pub use conduit_core as core;
pub use conduit_rpc as rpc;
pub use conduit_bus as bus;

// Re-export the resolver, under its own module so its vocabulary (`NodeKey`,
// `Plan`, ...) doesn't collide with the wire layers' own `NodeId`/`BusId`.
pub mod resolver {
    pub use conduit_resolver::{
        DependencyGraph, GraphDiff, GraphError, NodeEntry, NodeKey, Plan, PlanStep, Provider, Requirements, Resolver,
        ResolverConfig, ResolverError, StaticProvider, UnresolvableDiagnostics,
    };
}

#[doc(hidden)]
pub extern crate tracing;

/// Convenience imports for building on top of the substrate.
///
/// ```ignore
/// use conduit::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Bus, BusConfig, BusError, Environment, Handler, RpcError, Transport, WireValue};
    pub use crate::resolver::{DependencyGraph, Resolver, ResolverConfig};
}
