//! Error taxonomy for the MUX layer (spec §7).

use std::fmt;

/// Errors surfaced by a [`Link`](crate::Link) implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The link was closed (locally or by the peer) before the operation completed.
    Closed,
    /// The peer sent something that violates the wire contract.
    Protocol(String),
    /// Underlying I/O failure.
    Io(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Closed => write!(f, "link closed"),
            LinkError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            LinkError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Errors surfaced by the muxer and per-channel reliability layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The underlying link is closed; all channels are terminated.
    LinkClosed,
    /// This specific channel has been closed.
    ChannelClosed { channel_id: String, reason: Option<String> },
    /// No heartbeat response arrived within the configured timeout; the link was aborted.
    HeartbeatTimeout,
    /// The peer violated the MUX wire protocol (e.g. duplicate channel id collision).
    Protocol(String),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::LinkClosed => write!(f, "link closed"),
            MuxError::ChannelClosed { channel_id, reason } => match reason {
                Some(r) => write!(f, "channel {channel_id} closed: {r}"),
                None => write!(f, "channel {channel_id} closed"),
            },
            MuxError::HeartbeatTimeout => write!(f, "heartbeat timeout, link aborted"),
            MuxError::Protocol(msg) => write!(f, "mux protocol error: {msg}"),
        }
    }
}

impl std::error::Error for MuxError {}

impl From<LinkError> for MuxError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Closed => MuxError::LinkClosed,
            LinkError::Protocol(msg) => MuxError::Protocol(msg),
            LinkError::Io(msg) => MuxError::Protocol(format!("io: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_error_display() {
        assert_eq!(LinkError::Closed.to_string(), "link closed");
        assert!(LinkError::Protocol("bad frame".into())
            .to_string()
            .contains("bad frame"));
    }

    #[test]
    fn mux_error_from_link_error() {
        assert_eq!(MuxError::from(LinkError::Closed), MuxError::LinkClosed);
        match MuxError::from(LinkError::Protocol("x".into())) {
            MuxError::Protocol(msg) => assert_eq!(msg, "x"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn channel_closed_display_with_and_without_reason() {
        let with_reason = MuxError::ChannelClosed {
            channel_id: "c1".into(),
            reason: Some("peer hung up".into()),
        };
        assert!(with_reason.to_string().contains("peer hung up"));

        let without_reason = MuxError::ChannelClosed {
            channel_id: "c1".into(),
            reason: None,
        };
        assert_eq!(without_reason.to_string(), "channel c1 closed");
    }
}
