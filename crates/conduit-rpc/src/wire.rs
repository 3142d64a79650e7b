//! [`WireValue`]: the universal argument/return representation serialized
//! over RPC (spec §4.4).
//!
//! Rust's static typing means "non-plain" isn't detected by runtime
//! introspection the way the original dynamic-language design does it;
//! instead the [`crate::pin`] and [`crate::stream`] modules construct
//! [`WireValue::Placeholder`] explicitly when they hand out a pin or stream
//! handle. The [`TypeHandlerRegistry`] stays the pluggable seam on the
//! *receiving* side, so deserializing a placeholder whose `kind` nobody
//! registered is still a typed error rather than a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// A non-plain value that was replaced during serialization with a
/// reference the peer can materialize (spec §4.4, §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    pub kind: String,
    pub id: u64,
    pub meta: Option<Box<WireValue>>,
}

/// The value type carried by `rpc-request`/`rpc-response`/`notify` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    /// Ordered, not a `HashMap`, so wire output is deterministic.
    Map(Vec<(String, WireValue)>),
    Placeholder(Placeholder),
}

impl WireValue {
    pub fn placeholder(kind: impl Into<String>, id: u64) -> Self {
        WireValue::Placeholder(Placeholder {
            kind: kind.into(),
            id,
            meta: None,
        })
    }

    pub fn placeholder_with_meta(kind: impl Into<String>, id: u64, meta: WireValue) -> Self {
        WireValue::Placeholder(Placeholder {
            kind: kind.into(),
            id,
            meta: Some(Box::new(meta)),
        })
    }

    pub fn as_placeholder(&self) -> Option<&Placeholder> {
        match self {
            WireValue::Placeholder(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Str(s.to_owned())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::Str(s)
    }
}

impl From<i64> for WireValue {
    fn from(n: i64) -> Self {
        WireValue::Int(n)
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        WireValue::Bool(b)
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(b: Vec<u8>) -> Self {
        WireValue::Bytes(b)
    }
}

/// A handler for one placeholder `kind`, invoked during deserialization to
/// validate/register bookkeeping for a received reference (spec §4.4: "must
/// be symmetric on both peers").
pub trait TypeHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Called once per received placeholder of this handler's kind, before
    /// the placeholder is handed back to application code. Handlers that
    /// need to track state (pin refcounts, stream bindings) do so here.
    fn on_receive(&self, placeholder: &Placeholder) -> Result<(), RpcError>;
}

/// The ordered set of registered [`TypeHandler`]s consulted while walking a
/// deserialized value.
#[derive(Clone, Default)]
pub struct TypeHandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TypeHandler>>,
}

impl TypeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TypeHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Walk `value` (and its nested structure) invoking the matching handler
    /// for every placeholder found. Returns
    /// [`RpcError::UnknownPlaceholderKind`] on the first unregistered kind.
    pub fn visit_received(&self, value: &WireValue) -> Result<(), RpcError> {
        // Worklist rather than recursion so a pathologically deep value
        // can't blow the stack (spec §9 design note).
        let mut stack = vec![value];
        while let Some(node) = stack.pop() {
            match node {
                WireValue::Placeholder(p) => {
                    let handler = self
                        .handlers
                        .get(p.kind.as_str())
                        .ok_or_else(|| RpcError::UnknownPlaceholderKind(p.kind.clone()))?;
                    handler.on_receive(p)?;
                    if let Some(meta) = &p.meta {
                        stack.push(meta);
                    }
                }
                WireValue::List(items) => stack.extend(items.iter()),
                WireValue::Map(entries) => stack.extend(entries.iter().map(|(_, v)| v)),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl TypeHandler for CountingHandler {
        fn kind(&self) -> &'static str {
            "counted"
        }

        fn on_receive(&self, _placeholder: &Placeholder) -> Result<(), RpcError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn visits_nested_placeholders() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = TypeHandlerRegistry::new();
        registry.register(Arc::new(CountingHandler {
            count: Arc::clone(&count),
        }));

        let value = WireValue::List(vec![
            WireValue::placeholder("counted", 1),
            WireValue::Map(vec![("x".into(), WireValue::placeholder("counted", 2))]),
        ]);
        registry.visit_received(&value).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_kind_is_a_typed_error() {
        let registry = TypeHandlerRegistry::new();
        let value = WireValue::placeholder("mystery", 7);
        assert_eq!(
            registry.visit_received(&value),
            Err(RpcError::UnknownPlaceholderKind("mystery".into()))
        );
    }

    #[test]
    fn roundtrips_through_postcard() {
        let value = WireValue::List(vec![
            WireValue::Int(42),
            WireValue::Str("hi".into()),
            WireValue::placeholder("pin", 3),
        ]);
        let bytes = postcard::to_allocvec(&value).unwrap();
        let back: WireValue = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
