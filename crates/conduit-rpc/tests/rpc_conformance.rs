//! RPC conformance tests, exercising the scenarios from spec §8.

use std::sync::Arc;

use conduit_core::{ChannelConfig, MemLink, MuxerConfig};
use conduit_rpc::{CallExecutor, Environment, MethodKind, RpcConfig, RpcError, RpcSession, WireValue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn register_echo(executor: &mut CallExecutor) {
    executor.register(
        "echo",
        MethodKind::Unary,
        Arc::new(|_env: Environment, input: Vec<WireValue>| {
            Box::pin(async move { Ok(input.into_iter().next().unwrap_or(WireValue::Null)) })
        }),
    );
}

#[tokio::test]
async fn scenario_echo_rpc_resolves() {
    init_tracing();
    let (a, b) = MemLink::pair();
    let client = RpcSession::connect(a, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;
    let server = RpcSession::connect(b, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;
    register_echo(&mut *server.executor().write().await);

    let result = client
        .ask("echo", vec![WireValue::Str("hi".into())], vec![])
        .await
        .unwrap();
    assert_eq!(result, WireValue::Str("hi".into()));
}

#[tokio::test]
async fn scenario_closing_transport_mid_call_rejects_with_link_closed() {
    init_tracing();
    let (a, b) = MemLink::pair();
    let client = RpcSession::connect(a, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;
    let server = RpcSession::connect(b, MuxerConfig::default(), ChannelConfig::default(), RpcConfig::default()).await;

    // A handler that never replies, so the call is still pending when we close.
    let (_never_tx, never_rx) = tokio::sync::oneshot::channel::<()>();
    let never_rx = Arc::new(tokio::sync::Mutex::new(Some(never_rx)));
    server.executor().write().await.register(
        "black-hole",
        MethodKind::Unary,
        Arc::new(move |_env: Environment, _input: Vec<WireValue>| {
            let never_rx = Arc::clone(&never_rx);
            Box::pin(async move {
                let rx = never_rx.lock().await.take().unwrap();
                let _ = rx.await;
                Ok(WireValue::Null)
            })
        }),
    );

    let client_manager = Arc::clone(client.call_manager());
    let call = tokio::spawn(async move { client_manager.ask("black-hole", vec![], vec![]).await });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    client.transport().close();

    assert_eq!(call.await.unwrap(), Err(RpcError::LinkClosed));
}
