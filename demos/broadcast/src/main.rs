//! Federated broadcast-ask demo over TCP (spec §8 scenario 3).
//!
//! Run the root first, then one or more leaves against it:
//!
//! ```text
//! conduit-broadcast root --addr 127.0.0.1:9100
//! conduit-broadcast leaf --addr 127.0.0.1:9100 --node-id s3
//! ```
//!
//! The root has two local subscribers on topic `news`; each attached leaf
//! contributes one more. Every few seconds the root issues a broadcast
//! `ask("news", "ping")` and prints how many branches replied.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use conduit_bus::{AnnounceOp, Bus, BusConfig};
use conduit_core::FramedLink;
use conduit_rpc::{Environment, Handler, WireValue};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the root bus and poll the `news` topic.
    Root {
        #[arg(long, default_value = "127.0.0.1:9100")]
        addr: String,
    },
    /// Attach a leaf bus to a running root, contributing one subscriber.
    Leaf {
        #[arg(long, default_value = "127.0.0.1:9100")]
        addr: String,
        #[arg(long, default_value = "leaf-node")]
        node_id: String,
    },
}

fn news_handler(node_id: String) -> Handler {
    Arc::new(move |_env: Environment, input: Vec<WireValue>| {
        let node_id = node_id.clone();
        Box::pin(async move {
            tracing::info!(%node_id, ?input, "handled broadcast ask");
            Ok(WireValue::Str(format!("ack from {node_id}")))
        })
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Root { addr } => run_root(&addr).await,
        Command::Leaf { addr, node_id } => run_leaf(&addr, &node_id).await,
    }
}

async fn run_root(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bus = Bus::new("root", None);

    bus.register_local_node("s1", None);
    bus.subscribe("s1", "news", news_handler("s1".to_string())).await;
    bus.register_local_node("s2", None);
    bus.subscribe("s2", "news", news_handler("s2".to_string())).await;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "root bus listening");

    let poll_bus = Arc::clone(&bus);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let results = poll_bus.broadcast_ask("news", "ping", vec![WireValue::Str("ping".into())], vec![]).await;
            tracing::info!(replies = results.len(), ?results, "broadcast ask completed");
        }
    });

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::info!(%peer, "leaf connected");
        let link = Arc::new(FramedLink::new(socket));
        let child_id = format!("leaf-{peer}");
        bus.attach_child(child_id, link, BusConfig::default()).await;
    }
}

async fn run_leaf(addr: &str, node_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bus = Bus::new(format!("leaf-{node_id}"), None);
    bus.register_local_node(node_id, None);

    let socket = TcpStream::connect(addr).await?;
    let link = Arc::new(FramedLink::new(socket));
    bus.attach_parent(link, BusConfig::default()).await;

    bus.subscribe(node_id, "news", news_handler(node_id.to_string())).await;
    bus.announce_node(node_id, AnnounceOp::Join).await;

    tracing::info!(%node_id, "leaf attached and subscribed, waiting for broadcasts");
    // Keep the process alive to keep serving broadcast asks forwarded down
    // from the root; Ctrl-C to detach.
    std::future::pending::<()>().await;
    Ok(())
}
