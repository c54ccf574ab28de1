//! Tool registry — the union of built-in and discovered tools, exposable
//! over the transport and reusable by the mailbox bridge.

pub mod builtin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

// ─── ToolDescriptor ───────────────────────────────────────────────────────────

/// A single tool definition, as returned in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Failures surfaced by `dispatch`.  The registry never translates these into
/// protocol form — the transport and the mailbox bridge each do their own
/// mapping.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

/// Failures surfaced by `register`.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{name}' has an invalid input schema: {reason}")]
    InvalidSchema { name: String, reason: String },
}

// ─── Tool trait ───────────────────────────────────────────────────────────────

/// A callable tool.  Implementations are resolved once at startup; the
/// registry holds them behind `Arc<dyn Tool>`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

// ─── ToolRegistry ─────────────────────────────────────────────────────────────

/// Registry of callable tools, keyed by unique name.  Built at startup and
/// shared immutably afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, so `tools/list` output is stable.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// The descriptor's schema is validated here, once — an invalid schema is
    /// a typed error at registration, never a surprise at list time.  On a
    /// name collision the first registrant is kept and the later one skipped
    /// with a logged conflict.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let descriptor = tool.descriptor();
        validate_schema(&descriptor)?;

        if self.tools.contains_key(&descriptor.name) {
            warn!(
                tool = %descriptor.name,
                "duplicate tool name — keeping first registrant, skipping this one"
            );
            return Ok(());
        }

        debug!(tool = %descriptor.name, "tool registered");
        self.order.push(descriptor.name.clone());
        self.tools.insert(descriptor.name, tool);
        Ok(())
    }

    /// Descriptors for every registered tool, in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor())
            .collect()
    }

    /// Look up and invoke a tool.  Pure lookup-and-invoke; callers translate
    /// `ToolError` into their own error shape.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.invoke(args).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Schema validation ────────────────────────────────────────────────────────

/// Validate an input schema at registration time.
///
/// Requirements: the schema is a JSON object, its `type` field (when present)
/// is a string, and the whole tree survives a lossless serialize→deserialize
/// round trip.
fn validate_schema(descriptor: &ToolDescriptor) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidSchema {
        name: descriptor.name.clone(),
        reason: reason.to_string(),
    };

    let Some(obj) = descriptor.input_schema.as_object() else {
        return Err(invalid("schema must be a JSON object"));
    };
    match obj.get("type") {
        None => return Err(invalid("schema is missing a 'type' field")),
        Some(Value::String(_)) => {}
        Some(_) => return Err(invalid("schema 'type' must be a string")),
    }

    let serialized = serde_json::to_string(&descriptor.input_schema)
        .map_err(|e| invalid(&format!("schema is not serializable: {e}")))?;
    let round_tripped: Value = serde_json::from_str(&serialized)
        .map_err(|e| invalid(&format!("schema does not deserialize: {e}")))?;
    if round_tripped != descriptor.input_schema {
        return Err(invalid("schema does not survive a serialize round trip"));
    }

    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeTool {
        descriptor: ToolDescriptor,
        reply: Value,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn descriptor(&self) -> ToolDescriptor {
            self.descriptor.clone()
        }

        async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
            Ok(self.reply.clone())
        }
    }

    fn fake(name: &str, schema: Value) -> Arc<dyn Tool> {
        Arc::new(FakeTool {
            descriptor: ToolDescriptor::new(name, "a fake tool", schema),
            reply: json!({"from": name}),
        })
    }

    fn object_schema() -> Value {
        json!({"type": "object", "properties": {}})
    }

    #[test]
    fn register_and_list() {
        let mut registry = ToolRegistry::new();
        registry.register(fake("b", object_schema())).unwrap();
        registry.register(fake("a", object_schema())).unwrap();

        let names: Vec<String> = registry
            .descriptors()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["b", "a"], "registration order is preserved");
    }

    #[test]
    fn descriptors_round_trip_identically() {
        let mut registry = ToolRegistry::new();
        registry
            .register(fake(
                "echo",
                json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"]
                }),
            ))
            .unwrap();

        for descriptor in registry.descriptors() {
            let raw = serde_json::to_string(&descriptor).unwrap();
            let back: ToolDescriptor = serde_json::from_str(&raw).unwrap();
            assert_eq!(back, descriptor);
        }
    }

    #[test]
    fn invalid_schema_is_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register(fake("bad", json!("not an object")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
        assert!(registry.is_empty());

        let err = registry
            .register(fake("bad2", json!({"properties": {}})))
            .unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn duplicate_name_keeps_first_registrant() {
        let mut registry = ToolRegistry::new();
        registry.register(fake("dup", object_schema())).unwrap();
        registry
            .register(Arc::new(FakeTool {
                descriptor: ToolDescriptor::new("dup", "the later one", object_schema()),
                reply: json!({"from": "later"}),
            }))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.descriptors()[0].description, "a fake tool");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.dispatch("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn dispatch_invokes_handler() {
        let mut registry = ToolRegistry::new();
        registry.register(fake("t", object_schema())).unwrap();
        let out = registry.dispatch("t", json!({})).await.unwrap();
        assert_eq!(out, json!({"from": "t"}));
    }
}
