//! The top-level [`Bus`]: wires together the local node table, the
//! routing table, and a set of bridge links into one federated pub/sub +
//! point-to-point substrate (spec §4.7-§4.10).
//!
//! Every bus in the tree runs the same code, so the client-initiates and
//! peer-forwards paths for broadcast `ask`/`tell` share
//! [`Bus::run_broadcast_ask`]/[`Bus::run_broadcast_tell`] -- a bus asked by
//! a child just runs the same fan-out one level further with that child
//! excluded, which is what makes the protocol compose across depth.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use conduit_core::{ChannelConfig, DynLink, MuxerConfig, Transport};
use conduit_rpc::{Environment, Handler, PinRegistry, WireValue};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::ask_session::AskSession;
use crate::config::BusConfig;
use crate::coordinator::{BridgeCoordinator, Inbound};
use crate::dispatcher::Dispatcher;
use crate::error::BusError;
use crate::messages::{AnnounceOp, BroadcastPayload, BusId, BusMessage, CallId, NodeId, P2pPayload, SubOp, Topic};
use crate::node_manager::LocalNodeManager;
use crate::routing::{NextHop, RoutingTable};

/// Key used in per-branch bookkeeping for the parent direction, since the
/// parent has no bus id of its own from this bus's point of view.
const PARENT_BRANCH: &str = "__parent__";

struct Bridge {
    transport: Arc<Transport>,
    coordinator: Arc<BridgeCoordinator>,
}

pub struct Bus {
    bus_id: BusId,
    node_manager: Arc<LocalNodeManager>,
    routing: Arc<RoutingTable>,
    dispatcher: Dispatcher,
    children: Mutex<HashMap<BusId, Arc<Bridge>>>,
    parent: Mutex<Option<Arc<Bridge>>>,
    remote_subs: Mutex<HashMap<Topic, HashSet<String>>>,
    p2p_pending: Mutex<HashMap<(String, CallId), oneshot::Sender<Result<WireValue, String>>>>,
    ask_forwards: Mutex<HashMap<(String, CallId), Arc<AskSession>>>,
    next_call_id: AtomicU64,
    self_weak: Weak<Bus>,
}

impl Bus {
    pub fn new(bus_id: impl Into<BusId>, pin_registry: Option<Arc<PinRegistry>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            bus_id: bus_id.into(),
            node_manager: LocalNodeManager::new(),
            routing: Arc::new(RoutingTable::new()),
            dispatcher: Dispatcher::new(pin_registry),
            children: Mutex::new(HashMap::new()),
            parent: Mutex::new(None),
            remote_subs: Mutex::new(HashMap::new()),
            p2p_pending: Mutex::new(HashMap::new()),
            ask_forwards: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            self_weak: weak.clone(),
        })
    }

    /// An owned handle to this bus, for tasks that must outlive the caller's
    /// stack frame (bridge read loops, spawned dispatch work).
    fn arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("Bus dropped while still in use")
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn node_manager(&self) -> &Arc<LocalNodeManager> {
        &self.node_manager
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Register a locally-hosted node and mark it local in the routing
    /// table. Does not announce it upward; call [`Bus::announce_node`]
    /// once the api is ready, so its parent (and transitively its
    /// parent's parent) learn the route.
    pub fn register_local_node(&self, node_id: impl Into<NodeId> + Clone, api: Option<Handler>) {
        self.node_manager.register_node(node_id.clone(), api);
        self.routing.set_local(node_id.into());
    }

    /// Tell the parent bridge (if any) that `node_id` joined or left this
    /// bus, so routes propagate up the tree (spec §4.8).
    pub async fn announce_node(&self, node_id: impl Into<NodeId>, op: AnnounceOp) {
        if let Some(parent) = self.parent.lock().clone() {
            let _ = parent.coordinator.send_node_announcement(node_id.into(), op).await;
        }
    }

    /// Register a local topic subscription and, if this bus has a parent,
    /// tell it so broadcasts on `topic` get forwarded down to us (spec
    /// §4.9). Returns `false` if `node_id` isn't registered.
    pub async fn subscribe(&self, node_id: &str, topic: impl Into<Topic>, consumer: Handler) -> bool {
        let topic = topic.into();
        let added = self.node_manager.add_subscription(node_id, topic.clone(), consumer);
        if added {
            if let Some(parent) = self.parent.lock().clone() {
                let _ = parent.coordinator.send_sub_update(topic, SubOp::Add, node_id.to_string(), None).await;
            }
        }
        added
    }

    // -- bridge attachment -------------------------------------------------

    async fn spawn_bridge(&self, link: DynLink, config: BusConfig, branch_key: String) -> Arc<Bridge> {
        let transport = Arc::new(Transport::connect(link, MuxerConfig::default(), ChannelConfig::default()).await);
        let coordinator = Arc::new(BridgeCoordinator::new(transport.control_sender().clone(), config));
        let bridge = Arc::new(Bridge {
            transport: Arc::clone(&transport),
            coordinator,
        });

        let bus = self.arc();
        let bridge_clone = Arc::clone(&bridge);
        let branch_key_clone = branch_key.clone();
        tokio::spawn(async move {
            bus.bridge_read_loop(branch_key_clone, bridge_clone).await;
        });

        bridge
    }

    pub async fn attach_child(&self, child_bus_id: impl Into<BusId>, link: DynLink, config: BusConfig) {
        let child_bus_id = child_bus_id.into();
        let bridge = self.spawn_bridge(link, config, child_bus_id.clone()).await;
        self.children.lock().insert(child_bus_id, bridge);
    }

    pub async fn attach_parent(&self, link: DynLink, config: BusConfig) {
        let bridge = self.spawn_bridge(link, config, PARENT_BRANCH.to_string()).await;
        *self.parent.lock() = Some(bridge);
    }

    fn get_bridge(&self, branch_key: &str) -> Option<Arc<Bridge>> {
        if branch_key == PARENT_BRANCH {
            self.parent.lock().clone()
        } else {
            self.children.lock().get(branch_key).cloned()
        }
    }

    fn all_branches(&self, exclude: Option<&str>) -> Vec<(String, Arc<Bridge>)> {
        let mut out: Vec<(String, Arc<Bridge>)> = self
            .children
            .lock()
            .iter()
            .map(|(id, b)| (id.clone(), Arc::clone(b)))
            .collect();
        if let Some(parent) = self.parent.lock().clone() {
            out.push((PARENT_BRANCH.to_string(), parent));
        }
        out.retain(|(id, _)| Some(id.as_str()) != exclude);
        out
    }

    fn branches_subscribed_to(&self, topic: &str, exclude: Option<&str>) -> Vec<(String, Arc<Bridge>)> {
        let subscribed = self.remote_subs.lock().get(topic).cloned().unwrap_or_default();
        self.all_branches(exclude)
            .into_iter()
            .filter(|(id, _)| subscribed.contains(id))
            .collect()
    }

    fn handle_bridge_disconnect(&self, branch_key: &str) {
        let stale: Vec<_> = self
            .ask_forwards
            .lock()
            .iter()
            .filter(|((branch, _), _)| branch == branch_key)
            .map(|(key, session)| (key.clone(), Arc::clone(session)))
            .collect();
        for (key, session) in stale {
            session.on_bridge_disconnect(branch_key);
            self.ask_forwards.lock().remove(&key);
        }
        let stale_pending: Vec<_> = self
            .p2p_pending
            .lock()
            .keys()
            .filter(|(branch, _)| branch == branch_key)
            .cloned()
            .collect();
        for key in stale_pending {
            if let Some(tx) = self.p2p_pending.lock().remove(&key) {
                drop(tx);
            }
        }
        if branch_key == PARENT_BRANCH {
            for node_id in self.routing.nodes_via_parent() {
                self.routing.remove(&node_id);
            }
            *self.parent.lock() = None;
        } else {
            for node_id in self.routing.nodes_via_child(branch_key) {
                self.routing.remove(&node_id);
            }
            self.children.lock().remove(branch_key);
        }
    }

    async fn bridge_read_loop(self: Arc<Self>, branch_key: String, bridge: Arc<Bridge>) {
        loop {
            match bridge.transport.control_recv().await {
                None => {
                    bridge.coordinator.fail_all_pending();
                    self.handle_bridge_disconnect(&branch_key);
                    return;
                }
                Some(bytes) => {
                    let message = match BusMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed bus message");
                            continue;
                        }
                    };
                    let inbound = bridge.coordinator.classify(message);
                    self.handle_inbound(&branch_key, &bridge, inbound).await;
                }
            }
        }
    }

    async fn handle_inbound(&self, branch_key: &str, bridge: &Arc<Bridge>, inbound: Inbound) {
        match inbound {
            Inbound::AckHandled => {}
            Inbound::Handshake { correlation_id } => {
                bridge.coordinator.reply_handshake(correlation_id).await;
            }
            Inbound::SubUpdate {
                correlation_id,
                topic,
                op,
                node_id,
                child_bus_id: _,
            } => {
                match op {
                    SubOp::Add => {
                        self.remote_subs.lock().entry(topic.clone()).or_default().insert(branch_key.to_string());
                    }
                    SubOp::Remove => {
                        if let Some(set) = self.remote_subs.lock().get_mut(&topic) {
                            set.remove(branch_key);
                        }
                    }
                }
                bridge.coordinator.reply_sub_update(correlation_id, Vec::new()).await;

                // Relay further up the tree, same as node announcements, so a
                // subscriber more than one hop away is still discoverable.
                if branch_key != PARENT_BRANCH {
                    if let Some(parent) = self.parent.lock().clone() {
                        let _ = parent.coordinator.send_sub_update(topic, op, node_id, None).await;
                    }
                }
            }
            Inbound::NodeAnnouncement {
                correlation_id,
                node_id,
                op,
            } => {
                match op {
                    AnnounceOp::Join => {
                        if branch_key == PARENT_BRANCH {
                            self.routing.set_via_parent(node_id.clone());
                        } else {
                            self.routing.set_via_child(node_id.clone(), branch_key);
                        }
                    }
                    AnnounceOp::Leave => self.routing.remove(&node_id),
                }
                bridge.coordinator.reply_node_announcement(correlation_id, Vec::new()).await;

                // Relay further up the tree so ancestors learn the route too.
                if branch_key != PARENT_BRANCH {
                    if let Some(parent) = self.parent.lock().clone() {
                        let _ = parent.coordinator.send_node_announcement(node_id, op).await;
                    }
                }
            }
            Inbound::P2p {
                source_id,
                destination_id,
                payload,
            } => self.handle_inbound_p2p(branch_key, bridge, source_id, destination_id, payload).await,
            Inbound::Broadcast { source_id, topic, payload } => {
                self.handle_inbound_broadcast(branch_key, bridge, source_id, topic, payload).await
            }
        }
    }

    async fn handle_inbound_p2p(
        &self,
        branch_key: &str,
        bridge: &Arc<Bridge>,
        source_id: NodeId,
        destination_id: NodeId,
        payload: P2pPayload,
    ) {
        match payload {
            P2pPayload::Ask { call_id, path, input, meta } => {
                let this = self.arc();
                let bridge = Arc::clone(bridge);
                let bus_id = self.bus_id.clone();
                tokio::spawn(async move {
                    let result = this.dispatch_p2p_ask(&destination_id, &path, input, meta).await;
                    let wire_result = result.map_err(|e| e.to_string());
                    bridge
                        .coordinator
                        .send_p2p(bus_id, source_id, P2pPayload::AckResult { call_id, result: wire_result })
                        .await;
                });
            }
            P2pPayload::Tell { path, input, meta } => {
                let this = self.arc();
                tokio::spawn(async move {
                    this.dispatch_p2p_tell(&destination_id, &path, input, meta).await;
                });
            }
            P2pPayload::AckResult { call_id, result } => {
                let key = (branch_key.to_string(), call_id);
                if let Some(session) = self.ask_forwards.lock().get(&key).cloned() {
                    let pseudo_node = format!("{branch_key}#{call_id}");
                    session.ack_result(branch_key, pseudo_node, result);
                } else if let Some(tx) = self.p2p_pending.lock().remove(&key) {
                    let _ = tx.send(result);
                }
            }
            P2pPayload::AckFin { call_id, total_results } => {
                let key = (branch_key.to_string(), call_id);
                if let Some(session) = self.ask_forwards.lock().remove(&key) {
                    session.ack_fin(branch_key, total_results);
                }
            }
        }
    }

    async fn handle_inbound_broadcast(
        &self,
        branch_key: &str,
        bridge: &Arc<Bridge>,
        source_id: NodeId,
        topic: Topic,
        payload: BroadcastPayload,
    ) {
        match payload {
            BroadcastPayload::Tell { path, input, meta } => {
                self.run_broadcast_tell(&topic, &path, input, meta, Some(branch_key)).await;
            }
            BroadcastPayload::Ask { call_id, path, input, meta } => {
                let this = self.arc();
                let bridge = Arc::clone(bridge);
                let branch_owned = branch_key.to_string();
                let bus_id = self.bus_id.clone();
                tokio::spawn(async move {
                    let results = this.run_broadcast_ask(&topic, &path, input, meta, Some(&branch_owned)).await;
                    let total = results.len() as u32;
                    for (_node_id, result) in results {
                        bridge
                            .coordinator
                            .send_p2p(bus_id.clone(), source_id.clone(), P2pPayload::AckResult { call_id, result })
                            .await;
                    }
                    bridge
                        .coordinator
                        .send_p2p(bus_id.clone(), source_id, P2pPayload::AckFin { call_id, total_results: total })
                        .await;
                });
            }
        }
    }

    // -- point-to-point -----------------------------------------------------

    pub async fn ask(
        &self,
        destination_id: &str,
        path: &str,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) -> Result<WireValue, BusError> {
        self.dispatch_p2p_ask(destination_id, path, input, meta).await
    }

    pub async fn tell(&self, destination_id: &str, path: &str, input: Vec<WireValue>, meta: Vec<WireValue>) {
        self.dispatch_p2p_tell(destination_id, path, input, meta).await;
    }

    async fn dispatch_p2p_ask(
        &self,
        destination_id: &str,
        path: &str,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) -> Result<WireValue, BusError> {
        match self.routing.lookup(destination_id) {
            Some(NextHop::Local) => self.node_manager.execute_p2p_ask(&self.bus_id, destination_id, path, input, meta).await,
            Some(NextHop::Parent) => self.forward_p2p_ask(PARENT_BRANCH, destination_id, path, input, meta).await,
            Some(NextHop::Child(child_id)) => self.forward_p2p_ask(&child_id, destination_id, path, input, meta).await,
            None if self.node_manager.has_node(destination_id) => {
                self.node_manager.execute_p2p_ask(&self.bus_id, destination_id, path, input, meta).await
            }
            None => Err(BusError::NodeNotFound(destination_id.to_string())),
        }
    }

    async fn dispatch_p2p_tell(&self, destination_id: &str, path: &str, input: Vec<WireValue>, meta: Vec<WireValue>) {
        match self.routing.lookup(destination_id) {
            Some(NextHop::Local) => self.node_manager.execute_p2p_tell(&self.bus_id, destination_id, path, input, meta).await,
            Some(NextHop::Parent) => self.forward_p2p_tell(PARENT_BRANCH, destination_id, path, input, meta).await,
            Some(NextHop::Child(child_id)) => self.forward_p2p_tell(&child_id, destination_id, path, input, meta).await,
            None if self.node_manager.has_node(destination_id) => {
                self.node_manager.execute_p2p_tell(&self.bus_id, destination_id, path, input, meta).await
            }
            None => tracing::debug!(destination_id, "tell dropped: no route"),
        }
    }

    async fn forward_p2p_ask(
        &self,
        branch_key: &str,
        destination_id: &str,
        path: &str,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) -> Result<WireValue, BusError> {
        let bridge = self.get_bridge(branch_key).ok_or_else(|| BusError::NodeNotFound(destination_id.to_string()))?;
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.p2p_pending.lock().insert((branch_key.to_string(), call_id), tx);
        bridge
            .coordinator
            .send_p2p(
                self.bus_id.clone(),
                destination_id.to_string(),
                P2pPayload::Ask {
                    call_id,
                    path: path.to_string(),
                    input,
                    meta,
                },
            )
            .await;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BusError::Rpc(e)),
            Err(_) => Err(BusError::Rpc("bridge disconnected before a result arrived".into())),
        }
    }

    async fn forward_p2p_tell(&self, branch_key: &str, destination_id: &str, path: &str, input: Vec<WireValue>, meta: Vec<WireValue>) {
        if let Some(bridge) = self.get_bridge(branch_key) {
            bridge
                .coordinator
                .send_p2p(
                    self.bus_id.clone(),
                    destination_id.to_string(),
                    P2pPayload::Tell {
                        path: path.to_string(),
                        input,
                        meta,
                    },
                )
                .await;
        }
    }

    // -- broadcast ------------------------------------------------------

    pub async fn broadcast_tell(&self, topic: &str, path: &str, input: Vec<WireValue>, meta: Vec<WireValue>) {
        self.run_broadcast_tell(topic, path, input, meta, None).await;
    }

    async fn run_broadcast_tell(
        &self,
        topic: &str,
        path: &str,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
        exclude_branch: Option<&str>,
    ) {
        let targets = self.node_manager.broadcast_targets(topic);
        let branches = self.branches_subscribed_to(topic, exclude_branch);
        let total = targets.len() + branches.len();
        let fanned = self.dispatcher.fan_out(&input, total.max(1));
        let mut fanned = fanned.into_iter();

        for (node_id, handler, closing) in targets {
            let args = fanned.next().unwrap_or_default();
            let mut node_meta = meta.clone();
            node_meta.insert(0, LocalNodeManager::bus_context_with_topic(&self.bus_id, &node_id, topic));
            let env = Environment::new(None, node_meta, closing);
            tokio::spawn(async move {
                if let Err(e) = handler(env, args).await {
                    tracing::error!(node_id = %node_id, error = %e, "unhandled error in broadcast tell handler");
                }
            });
        }

        for (_, bridge) in branches {
            let args = fanned.next().unwrap_or_else(|| input.clone());
            bridge
                .coordinator
                .send_broadcast(
                    self.bus_id.clone(),
                    topic.to_string(),
                    BroadcastPayload::Tell {
                        path: path.to_string(),
                        input: args,
                        meta: meta.clone(),
                    },
                )
                .await;
        }
    }

    pub async fn broadcast_ask(
        &self,
        topic: &str,
        path: &str,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
    ) -> Vec<(NodeId, Result<WireValue, String>)> {
        self.run_broadcast_ask(topic, path, input, meta, None).await
    }

    async fn run_broadcast_ask(
        &self,
        topic: &str,
        path: &str,
        input: Vec<WireValue>,
        meta: Vec<WireValue>,
        exclude_branch: Option<&str>,
    ) -> Vec<(NodeId, Result<WireValue, String>)> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let targets = self.node_manager.broadcast_targets(topic);
        let branches = self.branches_subscribed_to(topic, exclude_branch);

        let mut branch_ids: Vec<String> = vec!["local".to_string()];
        branch_ids.extend(branches.iter().map(|(id, _)| id.clone()));
        let (session, done) = AskSession::new(branch_ids);

        for (id, _) in &branches {
            self.ask_forwards.lock().insert((id.clone(), call_id), Arc::clone(&session));
        }

        let total = targets.len() + branches.len();
        let fanned = self.dispatcher.fan_out(&input, total.max(1));
        let mut fanned = fanned.into_iter();

        let local_count = targets.len() as u32;
        let local_session = Arc::clone(&session);
        let bus_id = self.bus_id.clone();
        let topic_owned = topic.to_string();
        let meta_owned = meta.clone();
        let local_args: Vec<Vec<WireValue>> = (0..targets.len()).map(|_| fanned.next().unwrap_or_default()).collect();
        tokio::spawn(async move {
            for ((node_id, handler, closing), args) in targets.into_iter().zip(local_args.into_iter()) {
                let mut node_meta = meta_owned.clone();
                node_meta.insert(0, LocalNodeManager::bus_context_with_topic(&bus_id, &node_id, &topic_owned));
                let env = Environment::new(None, node_meta, closing);
                let result = handler(env, args).await.map_err(|e| e.to_string());
                local_session.ack_result("local", node_id, result);
            }
            local_session.ack_fin("local", local_count);
        });

        for (branch_id, bridge) in branches {
            let args = fanned.next().unwrap_or_else(|| input.clone());
            bridge
                .coordinator
                .send_broadcast(
                    self.bus_id.clone(),
                    topic.to_string(),
                    BroadcastPayload::Ask {
                        call_id,
                        path: path.to_string(),
                        input: args,
                        meta: meta.clone(),
                    },
                )
                .await;
            let _ = branch_id;
        }

        let _ = done.await;
        session.results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::MemLink;

    fn echo_handler() -> Handler {
        Arc::new(|_env, input| Box::pin(async move { Ok(input.into_iter().next().unwrap_or(WireValue::Null)) }))
    }

    #[tokio::test]
    async fn local_ask_resolves_without_any_bridge() {
        let bus = Bus::new("root", None);
        bus.register_local_node("n1", Some(echo_handler()));
        let result = bus.ask("n1", "echo", vec![WireValue::Str("hi".into())], vec![]).await;
        assert_eq!(result, Ok(WireValue::Str("hi".into())));
    }

    #[tokio::test]
    async fn ask_through_child_bridge_reaches_a_remotely_hosted_node() {
        let parent = Bus::new("parent", None);
        let child = Bus::new("child", None);
        child.register_local_node("remote-n1", Some(echo_handler()));

        let (link_a, link_b) = MemLink::pair();
        parent.attach_child("child", link_a, BusConfig::default()).await;
        child.attach_parent(link_b, BusConfig::default()).await;

        parent.routing().set_via_child("remote-n1", "child");

        let result = parent
            .ask("remote-n1", "echo", vec![WireValue::Str("hey".into())], vec![])
            .await;
        assert_eq!(result, Ok(WireValue::Str("hey".into())));
    }

    #[tokio::test]
    async fn broadcast_ask_collects_local_results() {
        let bus = Bus::new("root", None);
        bus.register_local_node("n1", Some(echo_handler()));
        bus.register_local_node("n2", Some(echo_handler()));
        bus.node_manager().add_subscription("n1", "news", echo_handler());
        bus.node_manager().add_subscription("n2", "news", echo_handler());

        let results = bus.broadcast_ask("news", "echo", vec![WireValue::Int(9)], vec![]).await;
        assert_eq!(results.len(), 2);
        for (_, result) in results {
            assert_eq!(result, Ok(WireValue::Int(9)));
        }
    }

    #[tokio::test]
    async fn ask_to_unknown_node_is_node_not_found() {
        let bus = Bus::new("root", None);
        let result = bus.ask("ghost", "echo", vec![], vec![]).await;
        assert_eq!(result, Err(BusError::NodeNotFound("ghost".into())));
    }
}
