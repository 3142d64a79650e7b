//! Tunables for the RPC layer (spec §4.5, §7).

use std::time::Duration;

/// Configuration for a [`crate::CallManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConfig {
    /// How long `ask` waits for a response before failing with
    /// [`crate::RpcError::Timeout`]. The spec only mandates a hard timeout
    /// for bus bridge acks (5s); general RPC calls get a generous default
    /// so a slow handler doesn't spuriously time out.
    pub call_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_call_timeout_is_30s() {
        assert_eq!(RpcConfig::default().call_timeout, Duration::from_secs(30));
    }
}
