//! Tunables for the BUS layer (spec §4.8).

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Timeout for `handshake`/`sub-update`/`node-announcement` acks.
    pub bridge_ack_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bridge_ack_timeout: Duration::from_secs(5),
        }
    }
}
