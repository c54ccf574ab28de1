/// Line-framed JSON-RPC server loop over a duplex byte stream.
///
/// Input is read line by line; each line is one message.  A malformed line
/// is logged and discarded without closing the stream.  The only bytes ever
/// written to the primary stream are complete single-line serialized
/// protocol messages — any stray byte there would desynchronize the peer's
/// parser, so all diagnostics go through `tracing` (stderr).  End-of-input
/// is a clean shutdown trigger, not an error.
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::transport::{
    handle_initialize, handle_ping, RpcError, RpcMessage, RpcResponse, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
};
use crate::tools::ToolError;
use crate::AppContext;

// ─── RpcServer ────────────────────────────────────────────────────────────────

/// Serves one connected peer.  `initialize` must be accepted before any
/// other request is honored.
pub struct RpcServer {
    ctx: Arc<AppContext>,
    initialized: bool,
}

impl RpcServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            initialized: false,
        }
    }

    /// Run the message loop until the input stream ends.
    pub async fn serve<R, W>(mut self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }

            // Lossy decode: a line that is not valid UTF-8 becomes a line
            // that is not valid JSON, and falls into the malformed-line
            // skip below instead of closing the stream.
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let msg: RpcMessage = match serde_json::from_str(line) {
                Ok(msg) => msg,
                Err(e) => {
                    // Local self-healing: skip the one bad line, keep serving.
                    warn!(err = %e, "malformed protocol line — skipped");
                    continue;
                }
            };

            if let Some(response) = self.handle(msg).await {
                let mut out = serde_json::to_string(&response)?;
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
        }

        info!("input stream closed — transport shutting down");
        Ok(())
    }

    /// Dispatch one message.  Returns `None` for notifications.
    async fn handle(&mut self, msg: RpcMessage) -> Option<RpcResponse> {
        let id = msg.id.clone();
        match msg.method.as_str() {
            "initialize" => {
                self.initialized = true;
                id.map(handle_initialize)
            }
            "initialized" | "notifications/initialized" => {
                debug!("peer reported initialized — session ready");
                None
            }
            "ping" => id.map(handle_ping),
            _ if !self.initialized => {
                warn!(method = %msg.method, "request before initialize — rejected");
                id.map(|id| {
                    RpcResponse::error(
                        id,
                        RpcError::new(INVALID_REQUEST, "server not initialized"),
                    )
                })
            }
            "tools/list" => id.map(|id| {
                RpcResponse::ok(id, json!({ "tools": self.ctx.registry.descriptors() }))
            }),
            "tools/call" => self.call_tool(id, msg.params).await,
            other => {
                // Unrecognized method: MethodNotFound for requests, silence
                // for notifications.
                debug!(method = other, "unrecognized method");
                id.map(|id| {
                    RpcResponse::error(
                        id,
                        RpcError::new(METHOD_NOT_FOUND, format!("method not found: {other}")),
                    )
                })
            }
        }
    }

    /// Handle `tools/call`: look up the handler, invoke it, and convert any
    /// failure into a protocol-level error.  A handler must never be allowed
    /// to crash the process.
    async fn call_tool(&self, id: Option<Value>, params: Option<Value>) -> Option<RpcResponse> {
        let params = params.unwrap_or(Value::Null);
        let name = match params.get("name").and_then(|v| v.as_str()) {
            Some(name) => name.to_string(),
            None => {
                return id.map(|id| {
                    RpcResponse::error(
                        id,
                        RpcError::new(INVALID_PARAMS, "missing required field 'name'"),
                    )
                });
            }
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let outcome = self.ctx.registry.dispatch(&name, arguments).await;

        // A notification-style call still executes, but gets no response.
        let id = id?;
        Some(match outcome {
            Ok(value) => RpcResponse::ok(id, wrap_tool_result(value)),
            Err(ToolError::NotFound(name)) => {
                warn!(tool = %name, "unknown tool");
                RpcResponse::error(
                    id,
                    RpcError::new(INVALID_PARAMS, format!("unknown tool: {name}")),
                )
            }
            Err(ToolError::InvalidArgs(reason)) => {
                RpcResponse::error(id, RpcError::new(INVALID_PARAMS, reason))
            }
            Err(ToolError::Execution(e)) => {
                warn!(tool = %name, err = %e, "tool execution failed");
                RpcResponse::error(
                    id,
                    RpcError::new(INTERNAL_ERROR, format!("tool '{name}' failed: {e}")),
                )
            }
        })
    }
}

/// Wrap a tool's raw result in the `tools/call` content envelope.
fn wrap_tool_result(value: Value) -> Value {
    let text = match &value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    json!({
        "content": [ { "type": "text", "text": text } ],
        "isError": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_preserves_string_payloads() {
        let wrapped = wrap_tool_result(json!("hi"));
        assert_eq!(wrapped["content"][0]["text"], json!("hi"));
    }

    #[test]
    fn wrap_serializes_structured_payloads() {
        let wrapped = wrap_tool_result(json!({"msg": "hi"}));
        let text = wrapped["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("\"hi\""));
    }
}
