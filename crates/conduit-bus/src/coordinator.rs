//! Protocol coordinator: the single reader and single sender for one
//! bridge link, classifying every [`BusMessage`] into control-plane
//! (acks routed to the [`PendingAckManager`], requests handed back to the
//! caller to answer) or data-plane (handed back as a typed event) --
//! spec §4.10.

use std::sync::Arc;

use conduit_core::ChannelSender;

use crate::config::BusConfig;
use crate::messages::{AnnounceOp, BroadcastPayload, BusMessage, CorrelationId, NodeId, P2pPayload, SubOp, Topic};
use crate::pending_ack::PendingAckManager;

/// What the coordinator wants the caller to do with one inbound message.
pub enum Inbound {
    /// A `*Response` was matched against a pending waiter; nothing further
    /// to do.
    AckHandled,
    /// A control-plane request the coordinator can't answer unilaterally
    /// -- the caller must validate it against bus state and reply with
    /// [`BridgeCoordinator::send_sub_update_response`] or similar.
    Handshake { correlation_id: CorrelationId },
    SubUpdate {
        correlation_id: CorrelationId,
        topic: Topic,
        op: SubOp,
        node_id: NodeId,
        child_bus_id: Option<String>,
    },
    NodeAnnouncement {
        correlation_id: CorrelationId,
        node_id: NodeId,
        op: AnnounceOp,
    },
    /// Data-plane traffic, passed through untouched for routing/dispatch.
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

/// Owns the one `ChannelSender` this bridge is allowed to write to, so
/// every reply funnels through a single place (spec §4.10 "single sender
/// on bridges").
pub struct BridgeCoordinator {
    sender: ChannelSender,
    handshake_acks: Arc<PendingAckManager<()>>,
    sub_update_acks: Arc<PendingAckManager<Vec<String>>>,
    announcement_acks: Arc<PendingAckManager<Vec<String>>>,
}

impl BridgeCoordinator {
    pub fn new(sender: ChannelSender, config: BusConfig) -> Self {
        Self {
            sender,
            handshake_acks: PendingAckManager::new(config),
            sub_update_acks: PendingAckManager::new(config),
            announcement_acks: PendingAckManager::new(config),
        }
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Classify one message read off the bridge.
    pub fn classify(&self, message: BusMessage) -> Inbound {
        match message {
            BusMessage::HandshakeResponse { correlation_id } => {
                self.handshake_acks.resolve(correlation_id, ());
                Inbound::AckHandled
            }
            BusMessage::SubUpdateResponse { correlation_id, errors } => {
                self.sub_update_acks.resolve(correlation_id, errors);
                Inbound::AckHandled
            }
            BusMessage::NodeAnnouncementResponse { correlation_id, errors } => {
                self.announcement_acks.resolve(correlation_id, errors);
                Inbound::AckHandled
            }
            BusMessage::Handshake { correlation_id } => Inbound::Handshake { correlation_id },
            BusMessage::SubUpdate {
                correlation_id,
                topic,
                op,
                node_id,
                child_bus_id,
            } => Inbound::SubUpdate {
                correlation_id,
                topic,
                op,
                node_id,
                child_bus_id,
            },
            BusMessage::NodeAnnouncement {
                correlation_id,
                node_id,
                op,
            } => Inbound::NodeAnnouncement {
                correlation_id,
                node_id,
                op,
            },
            BusMessage::P2p {
                source_id,
                destination_id,
                payload,
            } => Inbound::P2p {
                source_id,
                destination_id,
                payload,
            },
            BusMessage::Broadcast {
                source_id,
                topic,
                payload,
            } => Inbound::Broadcast {
                source_id,
                topic,
                payload,
            },
        }
    }

    async fn send(&self, message: BusMessage) -> Result<(), conduit_core::MuxError> {
        self.sender.send(message.encode()).await
    }

    pub async fn send_handshake(&self) -> Result<(), crate::error::BusError> {
        let (correlation_id, rx) = self.handshake_acks.begin();
        self.send(BusMessage::Handshake { correlation_id }).await.map_err(|_| crate::error::BusError::Rpc("link closed".into()))?;
        self.handshake_acks.wait(correlation_id, rx).await.map(|_| ())
    }

    pub async fn reply_handshake(&self, correlation_id: CorrelationId) {
        let _ = self.send(BusMessage::HandshakeResponse { correlation_id }).await;
    }

    pub async fn send_sub_update(
        &self,
        topic: Topic,
        op: SubOp,
        node_id: NodeId,
        child_bus_id: Option<String>,
    ) -> Result<Vec<String>, crate::error::BusError> {
        let (correlation_id, rx) = self.sub_update_acks.begin();
        self.send(BusMessage::SubUpdate {
            correlation_id,
            topic,
            op,
            node_id,
            child_bus_id,
        })
        .await
        .map_err(|_| crate::error::BusError::Rpc("link closed".into()))?;
        self.sub_update_acks.wait(correlation_id, rx).await
    }

    pub async fn reply_sub_update(&self, correlation_id: CorrelationId, errors: Vec<String>) {
        let _ = self.send(BusMessage::SubUpdateResponse { correlation_id, errors }).await;
    }

    pub async fn send_node_announcement(
        &self,
        node_id: NodeId,
        op: AnnounceOp,
    ) -> Result<Vec<String>, crate::error::BusError> {
        let (correlation_id, rx) = self.announcement_acks.begin();
        self.send(BusMessage::NodeAnnouncement { correlation_id, node_id, op })
            .await
            .map_err(|_| crate::error::BusError::Rpc("link closed".into()))?;
        self.announcement_acks.wait(correlation_id, rx).await
    }

    pub async fn reply_node_announcement(&self, correlation_id: CorrelationId, errors: Vec<String>) {
        let _ = self
            .send(BusMessage::NodeAnnouncementResponse { correlation_id, errors })
            .await;
    }

    pub async fn send_p2p(&self, source_id: NodeId, destination_id: NodeId, payload: P2pPayload) {
        let _ = self
            .send(BusMessage::P2p {
                source_id,
                destination_id,
                payload,
            })
            .await;
    }

    pub async fn send_broadcast(&self, source_id: NodeId, topic: Topic, payload: BroadcastPayload) {
        let _ = self.send(BusMessage::Broadcast { source_id, topic, payload }).await;
    }

    /// The bridge disconnected: unblock every pending control-plane caller
    /// rather than leaving them to time out one by one.
    pub fn fail_all_pending(&self) {
        self.handshake_acks.fail_all();
        self.sub_update_acks.fail_all();
        self.announcement_acks.fail_all();
    }
}
