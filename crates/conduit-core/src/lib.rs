//! `conduit-core`: reliable multiplexed channels over an abstract duplex
//! link (the MUX layer).
//!
//! A [`Link`] carries opaque [`Packet`]s between two endpoints without
//! promising ordering or delivery. [`Muxer`] layers heartbeat liveness and
//! per-channel sliding-window reliability on top, and [`Transport`] exposes
//! the resulting surface as a control channel plus on-demand stream
//! channels.

pub mod channel;
pub mod config;
pub mod error;
pub mod framed_link;
pub mod link;
pub mod mem_link;
pub mod muxer;
pub mod packet;
pub mod transport;

pub use channel::{ChannelInbox, ChannelReceiver, ChannelSender, ChannelStatus};
pub use config::{ChannelConfig, MuxerConfig, PRE_HANDSHAKE_WINDOW_SIZE};
pub use error::{LinkError, MuxError};
pub use framed_link::FramedLink;
pub use link::{DynLink, Link};
pub use mem_link::MemLink;
pub use muxer::{IncomingChannel, Muxer};
pub use packet::{Packet, Seq, CONTROL_CHANNEL_ID};
pub use transport::Transport;
