//! Bus conformance tests, exercising the broadcast-ask scenario and
//! disconnect invariants from spec §8.

use std::sync::Arc;

use conduit_bus::{AnnounceOp, Bus, BusConfig, BusError};
use conduit_core::MemLink;
use conduit_rpc::{Environment, Handler, WireValue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn echo_handler() -> Handler {
    Arc::new(|_env: Environment, input: Vec<WireValue>| Box::pin(async move { Ok(input.into_iter().next().unwrap_or(WireValue::Null)) }))
}

/// Bus A (local subscribers s1, s2) linked to Bus B (local subscriber
/// s3). A broadcast `ask` issued at A collects exactly three results.
#[tokio::test]
async fn scenario_broadcast_ask_fans_out_across_a_bridge() {
    init_tracing();

    let bus_a = Bus::new("a", None);
    let bus_b = Bus::new("b", None);

    bus_a.register_local_node("s1", None);
    bus_a.subscribe("s1", "t", echo_handler()).await;
    bus_a.register_local_node("s2", None);
    bus_a.subscribe("s2", "t", echo_handler()).await;

    bus_b.register_local_node("s3", None);

    let (link_a, link_b) = MemLink::pair();
    bus_a.attach_child("b", link_a, BusConfig::default()).await;
    bus_b.attach_parent(link_b, BusConfig::default()).await;

    // s3 joins after the bridge is up: subscribing relays a SubUpdate to
    // the parent, which is what makes A route the broadcast ask to B.
    bus_b.subscribe("s3", "t", echo_handler()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let results = bus_a.broadcast_ask("t", "q", vec![WireValue::Str("q".into())], vec![]).await;
    assert_eq!(results.len(), 3);
    for (_, result) in &results {
        assert_eq!(result, &Ok(WireValue::Str("q".into())));
    }
}

/// A node announced from a child bus becomes reachable by the parent's
/// `ask` purely through the `node-announcement` handshake, with no test
/// code poking the routing table directly.
#[tokio::test]
async fn scenario_node_announcement_establishes_the_route() {
    init_tracing();

    let bus_a = Bus::new("a", None);
    let bus_b = Bus::new("b", None);
    bus_b.register_local_node("remote-n1", Some(echo_handler()));

    let (link_a, link_b) = MemLink::pair();
    bus_a.attach_child("b", link_a, BusConfig::default()).await;
    bus_b.attach_parent(link_b, BusConfig::default()).await;

    assert_eq!(
        bus_a.ask("remote-n1", "echo", vec![], vec![]).await,
        Err(BusError::NodeNotFound("remote-n1".into()))
    );

    bus_b.announce_node("remote-n1", AnnounceOp::Join).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let result = bus_a.ask("remote-n1", "echo", vec![WireValue::Int(1)], vec![]).await;
    assert_eq!(result, Ok(WireValue::Int(1)));
}
