//! Wire messages exchanged on a bridge link (spec §6).

use serde::{Deserialize, Serialize};

use conduit_rpc::WireValue;

pub type NodeId = String;
pub type BusId = String;
pub type Topic = String;
pub type CallId = u64;
pub type CorrelationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnounceOp {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum P2pPayload {
    Ask {
        call_id: CallId,
        path: String,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    },
    Tell {
        path: String,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    },
    AckResult {
        call_id: CallId,
        result: Result<WireValue, String>,
    },
    AckFin {
        call_id: CallId,
        total_results: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastPayload {
    Ask {
        call_id: CallId,
        path: String,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    },
    Tell {
        path: String,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    },
}

/// One message exchanged on a bridge link between two buses (spec §4.10
/// classifies these by `kind` into control-plane vs. data-plane).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    Handshake {
        correlation_id: CorrelationId,
    },
    HandshakeResponse {
        correlation_id: CorrelationId,
    },
    SubUpdate {
        correlation_id: CorrelationId,
        topic: Topic,
        op: SubOp,
        node_id: NodeId,
        child_bus_id: Option<BusId>,
    },
    SubUpdateResponse {
        correlation_id: CorrelationId,
        errors: Vec<String>,
    },
    NodeAnnouncement {
        correlation_id: CorrelationId,
        node_id: NodeId,
        op: AnnounceOp,
    },
    NodeAnnouncementResponse {
        correlation_id: CorrelationId,
        errors: Vec<String>,
    },
    P2p {
        source_id: NodeId,
        destination_id: NodeId,
        payload: P2pPayload,
    },
    Broadcast {
        source_id: NodeId,
        topic: Topic,
        payload: BroadcastPayload,
    },
}

impl BusMessage {
    /// Whether this is a control-plane message (routed to internal
    /// handlers / the pending-ack manager) or data-plane (emitted as a
    /// typed event) -- spec §4.10.
    pub fn is_control_plane(&self) -> bool {
        matches!(
            self,
            BusMessage::Handshake { .. }
                | BusMessage::HandshakeResponse { .. }
                | BusMessage::SubUpdate { .. }
                | BusMessage::SubUpdateResponse { .. }
                | BusMessage::NodeAnnouncement { .. }
                | BusMessage::NodeAnnouncementResponse { .. }
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("BusMessage encoding is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_control_vs_data_plane() {
        assert!(BusMessage::Handshake { correlation_id: 1 }.is_control_plane());
        assert!(!BusMessage::Broadcast {
            source_id: "a".into(),
            topic: "t".into(),
            payload: BroadcastPayload::Tell {
                path: "p".into(),
                input: vec![],
                meta: vec![],
            }
        }
        .is_control_plane());
    }

    #[test]
    fn roundtrips() {
        let msg = BusMessage::SubUpdate {
            correlation_id: 7,
            topic: "news".into(),
            op: SubOp::Add,
            node_id: "n1".into(),
            child_bus_id: None,
        };
        assert_eq!(BusMessage::decode(&msg.encode()).unwrap(), msg);
    }
}
