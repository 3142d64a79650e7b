//! Echo RPC and stream-transfer demo over TCP (spec §8 scenarios 1-2).
//!
//! ```text
//! conduit-echo serve --addr 127.0.0.1:9000
//! conduit-echo call --addr 127.0.0.1:9000 --message hi
//! conduit-echo stream --addr 127.0.0.1:9000 --values 1,2,3
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use conduit_core::{ChannelConfig, FramedLink, MuxerConfig, Transport};
use conduit_rpc::{CallExecutor, Environment, MethodKind, RpcConfig, RpcSession, StreamReader, StreamWriter, WireValue};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the echo server, accepting both unary asks and pushed streams.
    Serve {
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: String,
    },
    /// Ask `echo` once and print the reply.
    Call {
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: String,
        #[arg(long, default_value = "hi")]
        message: String,
    },
    /// Push a chunked stream of integers and wait for the drain ack.
    Stream {
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: String,
        #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
        values: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve { addr } => serve(&addr).await,
        Command::Call { addr, message } => call(&addr, &message).await,
        Command::Stream { addr, values } => stream(&addr, values).await,
    }
}

async fn serve(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "echo server listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::info!(%peer, "accepted connection");
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket).await {
                tracing::warn!(%peer, error = %e, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(socket: TcpStream) -> Result<(), Box<dyn std::error::Error>> {
    let link = Arc::new(FramedLink::new(socket));
    let session = RpcSession::connect(link, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;

    session.executor().write().await.register(
        "echo",
        MethodKind::Unary,
        Arc::new(|_env: Environment, input: Vec<WireValue>| Box::pin(async move { Ok(input.into_iter().next().unwrap_or(WireValue::Null)) })),
    );

    // Drain any stream the peer pushes at us, logging each chunk.
    while let Some(incoming) = session.transport().accept_incoming().await {
        let mut reader = StreamReader::from_incoming(incoming.channel_id, incoming.sender, incoming.inbox);
        tokio::spawn(async move {
            while let Ok(Some(item)) = reader.recv().await {
                tracing::info!(?item, channel = reader.channel_id(), "received stream chunk");
            }
            tracing::info!(channel = reader.channel_id(), "stream drained");
        });
    }

    Ok(())
}

async fn call(addr: &str, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let socket = TcpStream::connect(addr).await?;
    let link = Arc::new(FramedLink::new(socket));
    let session = RpcSession::connect(link, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;

    let result = session.ask("echo", vec![WireValue::Str(message.to_string())], vec![]).await?;
    println!("{:?}", result);
    session.transport().close();
    Ok(())
}

async fn stream(addr: &str, values: Vec<i64>) -> Result<(), Box<dyn std::error::Error>> {
    let socket = TcpStream::connect(addr).await?;
    let link = Arc::new(FramedLink::new(socket));
    let session = RpcSession::connect(link, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;

    let writer = StreamWriter::open(session.transport(), "upload").await;
    for v in values {
        writer.push(WireValue::Int(v)).await?;
    }
    writer.close().await?;
    println!("stream drained and acked");

    session.transport().close();
    Ok(())
}
