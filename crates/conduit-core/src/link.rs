//! The [`Link`] trait: an abstract full-duplex message pipe (spec §1, §6).
//!
//! MUX is defined abstractly over a link; any transport that can move
//! whole [`Packet`]s in both directions and preserve message boundaries
//! satisfies it. Ordering and delivery are MUX's job, not the link's.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LinkError;
use crate::packet::Packet;

/// An abstract full-duplex message pipe carrying opaque [`Packet`]s.
///
/// Implementations need only preserve message boundaries; they need not
/// preserve ordering or guarantee delivery, since [`crate::Muxer`] layers
/// both on top.
#[async_trait]
pub trait Link: Send + Sync + fmt::Debug + 'static {
    /// Send a single packet. Returns [`LinkError::Closed`] if the link is
    /// already closed.
    async fn send(&self, packet: Packet) -> Result<(), LinkError>;

    /// Receive the next packet, in whatever order the underlying transport
    /// delivers it. Returns [`LinkError::Closed`] when the link has been
    /// closed (locally, by the peer, or aborted).
    async fn recv(&self) -> Result<Packet, LinkError>;

    /// Gracefully close the link. Idempotent.
    fn close(&self);

    /// Abort the link immediately with a reason, surfaced to both ends as
    /// the terminal close. Idempotent.
    fn abort(&self, reason: String) {
        tracing::warn!(reason, "link aborted");
        self.close();
    }

    /// Whether the link has been closed or aborted.
    fn is_closed(&self) -> bool;
}

/// Object-safe handle to any [`Link`] implementation.
pub type DynLink = Arc<dyn Link>;
