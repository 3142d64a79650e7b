//! Local Node Manager: the bus's table of locally-hosted nodes and their
//! topic subscriptions (spec §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_rpc::{Environment, Handler, WireValue};
use parking_lot::Mutex;

use crate::error::BusError;
use crate::messages::{NodeId, Topic};

struct LocalNode {
    api: Option<Handler>,
    subscriptions: HashMap<Topic, Handler>,
    closing: Arc<AtomicBool>,
}

impl LocalNode {
    fn new(api: Option<Handler>) -> Self {
        Self {
            api,
            subscriptions: HashMap::new(),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// `local_nodes: NodeId -> {p2p_api?, subscriptions: Topic -> consumer_api}`
/// plus a `closing: set<NodeId>` (spec §4.7).
#[derive(Default)]
pub struct LocalNodeManager {
    nodes: Mutex<HashMap<NodeId, LocalNode>>,
}

impl LocalNodeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_node(&self, node_id: impl Into<NodeId>, api: Option<Handler>) {
        self.nodes.lock().insert(node_id.into(), LocalNode::new(api));
    }

    /// Returns `false` if `node_id` isn't registered.
    pub fn update_node_api(&self, node_id: &str, api: Handler) -> bool {
        match self.nodes.lock().get_mut(node_id) {
            Some(node) => {
                node.api = Some(api);
                true
            }
            None => false,
        }
    }

    pub fn add_subscription(&self, node_id: &str, topic: impl Into<Topic>, consumer: Handler) -> bool {
        match self.nodes.lock().get_mut(node_id) {
            Some(node) => {
                node.subscriptions.insert(topic.into(), consumer);
                true
            }
            None => false,
        }
    }

    pub fn remove_subscription(&self, node_id: &str, topic: &str) {
        if let Some(node) = self.nodes.lock().get_mut(node_id) {
            node.subscriptions.remove(topic);
        }
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
    }

    pub fn mark_as_closing(&self, node_id: &str) {
        if let Some(node) = self.nodes.lock().get(node_id) {
            node.closing.store(true, Ordering::Release);
        }
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.lock().contains_key(node_id)
    }

    pub fn get_local_node_ids(&self) -> Vec<NodeId> {
        self.nodes.lock().keys().cloned().collect()
    }

    pub fn get_topics_for_node(&self, node_id: &str) -> Vec<Topic> {
        self.nodes
            .lock()
            .get(node_id)
            .map(|n| n.subscriptions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every local subscriber id bound to `topic`, used by the pub/sub
    /// dispatcher for fan-out.
    pub fn subscribers_for_topic(&self, topic: &str) -> Vec<NodeId> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, n)| n.subscriptions.contains_key(topic))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn bus_context(source_node_id: &str, local_node_id: &str, topic: Option<&str>) -> WireValue {
        let mut fields = vec![
            ("source_node_id".to_string(), WireValue::Str(source_node_id.to_string())),
            ("local_node_id".to_string(), WireValue::Str(local_node_id.to_string())),
        ];
        if let Some(t) = topic {
            fields.push(("topic".to_string(), WireValue::Str(t.to_string())));
        }
        WireValue::Map(fields)
    }

    /// Execute a p2p `ask` against `node_id`'s registered api.
    pub async fn execute_p2p_ask(
        &self,
        source_node_id: &str,
        node_id: &str,
        _path: &str,
        input: Vec<WireValue>,
        mut meta: Vec<WireValue>,
    ) -> Result<WireValue, BusError> {
        let (handler, closing) = {
            let nodes = self.nodes.lock();
            let node = nodes.get(node_id).ok_or_else(|| BusError::NodeNotFound(node_id.to_string()))?;
            if node.closing.load(Ordering::Acquire) {
                return Err(BusError::NodeClosing(node_id.to_string()));
            }
            let handler = node.api.clone().ok_or_else(|| BusError::ProcedureNotReady(node_id.to_string()))?;
            (handler, Arc::clone(&node.closing))
        };
        meta.insert(0, Self::bus_context(source_node_id, node_id, None));
        let env = Environment::new(None, meta, closing);
        handler(env, input).await.map_err(BusError::from)
    }

    /// Execute a p2p `tell`: node-not-found/closing/handler errors are
    /// logged, never surfaced (spec §4.7 "for tell silently drops").
    pub async fn execute_p2p_tell(
        &self,
        source_node_id: &str,
        node_id: &str,
        path: &str,
        input: Vec<WireValue>,
        mut meta: Vec<WireValue>,
    ) {
        let entry = {
            let nodes = self.nodes.lock();
            match nodes.get(node_id) {
                None => {
                    tracing::debug!(node_id, "tell dropped: node not found");
                    None
                }
                Some(node) if node.closing.load(Ordering::Acquire) => {
                    tracing::debug!(node_id, "tell dropped: node closing");
                    None
                }
                Some(node) => node.api.clone().map(|h| (h, Arc::clone(&node.closing))),
            }
        };
        let Some((handler, closing)) = entry else { return };
        meta.insert(0, Self::bus_context(source_node_id, node_id, None));
        let env = Environment::new(None, meta, closing);
        if let Err(e) = handler(env, input).await {
            tracing::error!(node_id, path, error = %e, "unhandled error in tell handler");
        }
    }

    /// All `(node_id, handler, closing)` triples subscribed to `topic`,
    /// used by broadcast dispatch.
    pub fn broadcast_targets(&self, topic: &str) -> Vec<(NodeId, Handler, Arc<AtomicBool>)> {
        self.nodes
            .lock()
            .iter()
            .filter_map(|(id, node)| {
                node.subscriptions
                    .get(topic)
                    .map(|h| (id.clone(), h.clone(), Arc::clone(&node.closing)))
            })
            .collect()
    }

    pub fn bus_context_with_topic(source_node_id: &str, local_node_id: &str, topic: &str) -> WireValue {
        Self::bus_context(source_node_id, local_node_id, Some(topic))
    }
}
