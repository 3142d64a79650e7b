//! Wire packets exchanged over a [`Link`](crate::Link).
//!
//! A packet is either a muxer-level liveness probe (`Ping`/`Pong`) or a
//! channel packet addressed to a specific channel id. The reserved channel
//! id `__control__` denotes the singleton control channel (spec §3).

use serde::{Deserialize, Serialize};

/// Reserved channel id for the singleton control channel.
pub const CONTROL_CHANNEL_ID: &str = "__control__";

/// A sequence number within a channel's sliding window.
pub type Seq = u64;

/// One packet as it crosses the [`Link`](crate::Link).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Muxer liveness probe. Answered with [`Packet::Pong`].
    Ping,
    /// Response to [`Packet::Ping`].
    Pong,
    /// Request to establish a channel.
    OpenStream { channel_id: String },
    /// Acknowledge establishment of a channel.
    OpenStreamAck { channel_id: String },
    /// Application payload. `seq` is monotonic per channel.
    Data {
        channel_id: String,
        seq: Seq,
        payload: Vec<u8>,
    },
    /// Cumulative-per-packet ack: acknowledges that `ack_seq` was received.
    Ack { channel_id: String, ack_seq: Seq },
    /// Graceful one-sided close of a channel.
    CloseChannel {
        channel_id: String,
        reason: Option<String>,
    },
}

impl Packet {
    /// The channel this packet belongs to, if any (`Ping`/`Pong` are muxer-level).
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Packet::Ping | Packet::Pong => None,
            Packet::OpenStream { channel_id }
            | Packet::OpenStreamAck { channel_id }
            | Packet::Data { channel_id, .. }
            | Packet::Ack { channel_id, .. }
            | Packet::CloseChannel { channel_id, .. } => Some(channel_id),
        }
    }

    /// Encode this packet to its wire representation (postcard).
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("Packet encoding is infallible")
    }

    /// Decode a packet from its wire representation.
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_variants() {
        let packets = vec![
            Packet::Ping,
            Packet::Pong,
            Packet::OpenStream {
                channel_id: "c1".into(),
            },
            Packet::OpenStreamAck {
                channel_id: "c1".into(),
            },
            Packet::Data {
                channel_id: "c1".into(),
                seq: 42,
                payload: vec![1, 2, 3],
            },
            Packet::Ack {
                channel_id: "c1".into(),
                ack_seq: 42,
            },
            Packet::CloseChannel {
                channel_id: "c1".into(),
                reason: Some("done".into()),
            },
        ];

        for p in packets {
            let bytes = p.encode();
            let back = Packet::decode(&bytes).unwrap();
            assert_eq!(p, back);
        }
    }

    #[test]
    fn channel_id_extraction() {
        assert_eq!(Packet::Ping.channel_id(), None);
        assert_eq!(
            Packet::Data {
                channel_id: "x".into(),
                seq: 0,
                payload: vec![]
            }
            .channel_id(),
            Some("x")
        );
    }
}
