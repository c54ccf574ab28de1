/// JSON-RPC 2.0 wire types and lifecycle handlers for the tool transport.
///
/// Protocol version 2024-11-05.  One message per line; responses are
/// correlated to requests by `id`, notifications carry no `id` and receive
/// no response.
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Core message types ───────────────────────────────────────────────────────

/// An incoming request or notification.  Notifications (no `id`) use the
/// same wire format but expect no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcMessage {
    /// Create a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// A response (success or error), keyed to the request's `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC error object (code + message, optional data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

// ─── Standard error codes ─────────────────────────────────────────────────────

pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// ─── Lifecycle handlers ───────────────────────────────────────────────────────

/// Server identification block included in `initialize` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Response body for the `initialize` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Handle an `initialize` request: capability/version negotiation.  Pure —
/// no side effects beyond the acknowledgment.
pub fn handle_initialize(id: Value) -> RpcResponse {
    let result = InitializeResult {
        protocol_version: "2024-11-05".into(),
        capabilities: serde_json::json!({
            "tools": { "listChanged": false }
        }),
        server_info: ServerInfo {
            name: "deskbridge".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    RpcResponse::ok(
        id,
        serde_json::to_value(&result).unwrap_or(Value::Null),
    )
}

/// Handle a `ping` request — respond with an empty result.
pub fn handle_ping(id: Value) -> RpcResponse {
    RpcResponse::ok(id, serde_json::json!({}))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id_on_the_wire() {
        let msg = RpcMessage::notification("initialized", None);
        let raw = serde_json::to_string(&msg).unwrap();
        assert!(!raw.contains("\"id\""));
        assert!(!raw.contains("\"params\""));
    }

    #[test]
    fn response_carries_the_request_id() {
        let resp = RpcResponse::ok(json!(7), json!({"ok": true}));
        let raw = serde_json::to_string(&resp).unwrap();
        let back: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(back["id"], json!(7));
        assert!(back.get("error").is_none());
    }

    #[test]
    fn initialize_reports_protocol_and_server() {
        let resp = handle_initialize(json!(1));
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], json!("2024-11-05"));
        assert_eq!(result["serverInfo"]["name"], json!("deskbridge"));
    }
}
