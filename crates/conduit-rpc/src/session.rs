//! [`RpcSession`]: wires a [`CallManager`] and [`CallExecutor`] to the same
//! control channel and spawns the background loop that routes each
//! incoming message to whichever one owns it.

use std::sync::Arc;

use conduit_core::{ChannelConfig, DynLink, MuxerConfig, Transport};
use tokio::sync::RwLock;

use crate::call_executor::CallExecutor;
use crate::call_manager::CallManager;
use crate::config::RpcConfig;
use crate::messages::RpcMessage;

/// One end of an RPC connection: a [`Transport`] plus the client and server
/// halves sharing its control channel.
pub struct RpcSession {
    transport: Arc<Transport>,
    call_manager: Arc<CallManager>,
    executor: Arc<RwLock<CallExecutor>>,
}

impl RpcSession {
    /// Connect over `link` and start routing control-channel messages.
    /// Register handlers on [`RpcSession::executor`] before traffic starts
    /// arriving, or accept that early requests for unregistered paths will
    /// see [`crate::RpcError::ProcedureNotFound`].
    pub async fn connect(link: DynLink, muxer_config: MuxerConfig, channel_config: ChannelConfig, rpc_config: RpcConfig) -> Self {
        let transport = Arc::new(Transport::connect(link, muxer_config, channel_config).await);
        let call_manager = CallManager::new(transport.control_sender().clone(), rpc_config);
        let executor = Arc::new(RwLock::new(CallExecutor::new(transport.control_sender().clone())));

        let session = Self {
            transport: Arc::clone(&transport),
            call_manager: Arc::clone(&call_manager),
            executor: Arc::clone(&executor),
        };

        tokio::spawn(Self::read_loop(transport, call_manager, executor));

        session
    }

    async fn read_loop(
        transport: Arc<Transport>,
        call_manager: Arc<CallManager>,
        executor: Arc<RwLock<CallExecutor>>,
    ) {
        loop {
            let bytes = match transport.control_recv().await {
                Some(bytes) => bytes,
                None => break,
            };
            let message = match RpcMessage::decode(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed rpc message");
                    continue;
                }
            };
            if call_manager.handle_message(&message) {
                continue;
            }
            executor.read().await.handle_message(message).await;
        }
        call_manager.reject_all_pending();
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn call_manager(&self) -> &Arc<CallManager> {
        &self.call_manager
    }

    pub fn executor(&self) -> &Arc<RwLock<CallExecutor>> {
        &self.executor
    }

    pub async fn ask(
        &self,
        path: impl Into<String>,
        input: Vec<crate::wire::WireValue>,
        meta: Vec<crate::wire::WireValue>,
    ) -> Result<crate::wire::WireValue, crate::error::RpcError> {
        self.call_manager.ask(path, input, meta).await
    }

    pub async fn tell(
        &self,
        path: impl Into<String>,
        input: Vec<crate::wire::WireValue>,
        meta: Vec<crate::wire::WireValue>,
    ) -> Result<(), crate::error::RpcError> {
        self.call_manager.tell(path, input, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_executor::Environment;
    use crate::messages::MethodKind;
    use crate::wire::WireValue;
    use conduit_core::MemLink;

    #[tokio::test]
    async fn echo_round_trip_through_two_sessions() {
        let (a, b) = MemLink::pair();
        let client = RpcSession::connect(
            a,
            MuxerConfig::default(),
            ChannelConfig::default(),
            RpcConfig::default(),
        )
        .await;
        let server = RpcSession::connect(
            b,
            MuxerConfig::default(),
            ChannelConfig::default(),
            RpcConfig::default(),
        )
        .await;

        server.executor().write().await.register(
            "echo",
            MethodKind::Unary,
            Arc::new(|_env: Environment, input: Vec<WireValue>| {
                Box::pin(async move { Ok(input.into_iter().next().unwrap_or(WireValue::Null)) })
            }),
        );

        let result = client
            .ask("echo", vec![WireValue::Str("hi".into())], vec![])
            .await
            .unwrap();
        assert_eq!(result, WireValue::Str("hi".into()));
    }

    #[tokio::test]
    async fn asking_after_close_fails_with_link_closed() {
        let (a, b) = MemLink::pair();
        let client = RpcSession::connect(
            a,
            MuxerConfig::default(),
            ChannelConfig::default(),
            RpcConfig::default(),
        )
        .await;
        let _server = RpcSession::connect(
            b,
            MuxerConfig::default(),
            ChannelConfig::default(),
            RpcConfig::default(),
        )
        .await;

        client.transport().close();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let result = client.ask("never-registered", vec![], vec![]).await;
        assert_eq!(result, Err(crate::error::RpcError::LinkClosed));
    }
}
