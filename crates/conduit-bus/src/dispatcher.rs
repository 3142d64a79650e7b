//! Fans a broadcast `tell`/`ask` payload out to `count` local subscribers
//! as semantically-equivalent clones (spec §4.9).
//!
//! `WireValue` is plain data and `Clone` handles the common case. The two
//! exceptions are handle-valued placeholders: a `"pin"` placeholder shared
//! by several subscribers needs its owner-side refcount bumped so that one
//! subscriber dropping its proxy doesn't collect the pin out from under the
//! others; a `"stream"` placeholder would need a real tee (one relay task
//! per extra subscriber duplicating the byte stream) to be truly
//! semantically equivalent, which isn't implemented yet -- subscribers
//! currently share the one upstream reader.

use std::sync::Arc;

use conduit_rpc::{PinRegistry, WireValue};

const STREAM_KIND: &str = "stream";

pub struct Dispatcher {
    pin_registry: Option<Arc<PinRegistry>>,
}

impl Dispatcher {
    pub fn new(pin_registry: Option<Arc<PinRegistry>>) -> Self {
        Self { pin_registry }
    }

    /// Produce `count` clones of `values`, bumping owner-side refcounts for
    /// any pin placeholders found along the way. Returns one `Vec<WireValue>`
    /// per subscriber, in the same order for all of them.
    pub fn fan_out(&self, values: &[WireValue], count: usize) -> Vec<Vec<WireValue>> {
        if count == 0 {
            return Vec::new();
        }
        // `count - 1` because the registry already counts for the first copy
        // the caller itself holds (the broadcast sender's own reference).
        let extra = count - 1;
        for value in values {
            self.account_for_fanout(value, extra);
        }
        (0..count).map(|_| values.to_vec()).collect()
    }

    fn account_for_fanout(&self, value: &WireValue, extra: usize) {
        if extra == 0 {
            return;
        }
        match value {
            WireValue::Placeholder(p) if p.kind == conduit_rpc::PIN_KIND => {
                if let Some(registry) = &self.pin_registry {
                    registry.bump_refcount(p.id, extra);
                }
            }
            WireValue::Placeholder(p) if p.kind == STREAM_KIND => {
                tracing::warn!(id = p.id, extra, "stream tee fan-out not implemented");
            }
            WireValue::List(items) => {
                for item in items {
                    self.account_for_fanout(item, extra);
                }
            }
            WireValue::Map(entries) => {
                for (_, v) in entries {
                    self.account_for_fanout(v, extra);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_returns_count_equivalent_clones() {
        let dispatcher = Dispatcher::new(None);
        let values = vec![WireValue::Str("hi".into()), WireValue::Int(7)];
        let clones = dispatcher.fan_out(&values, 3);
        assert_eq!(clones.len(), 3);
        for c in &clones {
            assert_eq!(c, &values);
        }
    }

    #[test]
    fn fan_out_zero_count_is_empty() {
        let dispatcher = Dispatcher::new(None);
        assert!(dispatcher.fan_out(&[WireValue::Null], 0).is_empty());
    }

    #[test]
    fn fan_out_bumps_pin_refcount_for_extra_subscribers() {
        use conduit_rpc::PinTarget;
        use async_trait::async_trait;

        struct NoopTarget;
        #[async_trait]
        impl PinTarget for NoopTarget {
            async fn call(
                &self,
                _method: &str,
                _args: Vec<WireValue>,
                _env: &conduit_rpc::Environment,
            ) -> Result<WireValue, conduit_rpc::RpcError> {
                Ok(WireValue::Null)
            }
        }

        let registry = PinRegistry::new();
        let placeholder = registry.pin(Arc::new(NoopTarget));
        let dispatcher = Dispatcher::new(Some(Arc::clone(&registry)));

        let id = match &placeholder {
            WireValue::Placeholder(p) => p.id,
            _ => unreachable!(),
        };

        dispatcher.fan_out(&[placeholder], 4);
        // Sender's own reference (1) plus 3 extra subscribers = 4 total.
        registry.release(id);
        registry.release(id);
        registry.release(id);
        assert!(registry.resolve(id).is_some());
        registry.release(id);
        assert!(registry.resolve(id).is_none());
    }
}
