//! Tunable constants for the MUX layer (spec §3, §4.1, §4.2).

use std::time::Duration;

/// Effective send window while a channel is in [`crate::ChannelStatus::PreHandshake`].
pub const PRE_HANDSHAKE_WINDOW_SIZE: usize = 8;

/// Configuration for a [`crate::Muxer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerConfig {
    /// Interval between liveness probes.
    pub heartbeat_interval: Duration,
    /// How long to wait for any packet (ideally a pong) before aborting the link.
    pub heartbeat_timeout: Duration,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a single channel's sliding-window reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Maximum number of unacknowledged packets in flight once established.
    pub window_size: usize,
    /// Size of the receiver's out-of-order reorder buffer.
    pub receive_buffer_size: usize,
    /// Retransmission timeout for an unacknowledged packet.
    pub ack_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            receive_buffer_size: 64,
            ack_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let muxer = MuxerConfig::default();
        assert_eq!(muxer.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(muxer.heartbeat_timeout, Duration::from_secs(10));

        let channel = ChannelConfig::default();
        assert_eq!(channel.ack_timeout, Duration::from_secs(2));
        assert_eq!(PRE_HANDSHAKE_WINDOW_SIZE, 8);
    }
}
