//! Built-in tools registered at startup.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use super::{Tool, ToolDescriptor, ToolError, ToolRegistry};
use crate::lock;

// ─── echo ─────────────────────────────────────────────────────────────────────

/// Round-trips a message back to the caller.  Doubles as the transport
/// smoke-test tool.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            "Echo a message back to the caller.",
            json!({
                "type": "object",
                "properties": {
                    "msg": { "type": "string", "description": "Message to echo." }
                },
                "required": ["msg"],
                "additionalProperties": false
            }),
        )
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let msg = args
            .get("msg")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field 'msg'".into()))?;
        Ok(json!({ "msg": msg }))
    }
}

// ─── bridge_status ────────────────────────────────────────────────────────────

/// Reports whether the bridge daemon behind a data directory is up: reads the
/// aggregate status file and probes the recorded pid for liveness.
pub struct BridgeStatusTool {
    status_file: PathBuf,
}

impl BridgeStatusTool {
    pub fn new(status_file: PathBuf) -> Self {
        Self { status_file }
    }
}

#[async_trait]
impl Tool for BridgeStatusTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "bridge_status",
            "Report the bridge daemon's aggregate status and liveness.",
            json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        )
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        let raw = match tokio::fs::read_to_string(&self.status_file).await {
            Ok(raw) => raw,
            Err(_) => {
                return Ok(json!({
                    "running": false,
                    "detail": "status file not found"
                }));
            }
        };

        let status: Value = serde_json::from_str(&raw)
            .map_err(|e| ToolError::Execution(anyhow::anyhow!("corrupt status file: {e}")))?;

        let pid = status.get("pid").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let running = pid != 0 && lock::pid_alive(pid);

        Ok(json!({
            "running": running,
            "status": status
        }))
    }
}

// ─── Registration ─────────────────────────────────────────────────────────────

/// Register every built-in tool.  Discovery happens once, here, at startup.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    status_file: PathBuf,
) -> Result<(), super::RegistryError> {
    registry.register(Arc::new(EchoTool))?;
    registry.register(Arc::new(BridgeStatusTool::new(status_file)))?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trips() {
        let out = EchoTool.invoke(json!({"msg": "hi"})).await.unwrap();
        assert_eq!(out, json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn echo_rejects_missing_msg() {
        let err = EchoTool.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn bridge_status_without_file_reports_down() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BridgeStatusTool::new(dir.path().join("status.json"));
        let out = tool.invoke(json!({})).await.unwrap();
        assert_eq!(out["running"], json!(false));
    }

    #[tokio::test]
    async fn bridge_status_reads_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "status": "running",
                "pid": std::process::id()
            }))
            .unwrap(),
        )
        .unwrap();

        let tool = BridgeStatusTool::new(path);
        let out = tool.invoke(json!({})).await.unwrap();
        assert_eq!(out["running"], json!(true));
    }

    #[test]
    fn builtins_register_cleanly() {
        let mut registry = ToolRegistry::new();
        register_builtins(&mut registry, PathBuf::from("status.json")).unwrap();
        assert!(registry.contains("echo"));
        assert!(registry.contains("bridge_status"));
    }
}
