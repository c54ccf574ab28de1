//! Aggregate status file: a best-effort cache for external status queries.
//!
//! Writes are skipped whenever there is nothing new to report.  The status
//! file may sit on a tree that other processes watch, and an unconditional
//! heartbeat write would re-trigger the very watcher observing it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

use super::model::now_rfc3339;

// ─── Status shapes ────────────────────────────────────────────────────────────

/// Health of one bridge component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn up() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// The aggregate record written to `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    /// "running" or "stopped".
    pub status: String,
    pub pid: u32,
    /// Seconds since this process started.  Excluded from the write-dedup
    /// key, like the heartbeat timestamp.
    pub uptime_secs: u64,
    /// Ids of entries currently pending or processing.
    pub pending: Vec<String>,
    /// Ids of terminal entries still inside their grace period.
    pub completed: Vec<String>,
    pub components: BTreeMap<String, ComponentHealth>,
    pub updated_at: String,
}

impl BridgeStatus {
    pub fn running(pid: u32) -> Self {
        Self {
            status: "running".into(),
            pid,
            uptime_secs: 0,
            pending: Vec::new(),
            completed: Vec::new(),
            components: BTreeMap::new(),
            updated_at: now_rfc3339(),
        }
    }

    /// The comparison key: everything except the heartbeat timestamp and
    /// the uptime counter, which advance on every snapshot.
    fn content_key(&self) -> BridgeStatus {
        let mut key = self.clone();
        key.updated_at = String::new();
        key.uptime_secs = 0;
        key
    }
}

// ─── StatusWriter ─────────────────────────────────────────────────────────────

/// Writes the aggregate status file, deduplicating consecutive writes by
/// content (ignoring the heartbeat timestamp).
pub struct StatusWriter {
    path: PathBuf,
    last: Mutex<Option<BridgeStatus>>,
}

impl StatusWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Write the status file if its content changed since the last write.
    /// Returns whether a write happened.
    pub fn write_if_changed(&self, status: &BridgeStatus) -> Result<bool> {
        let key = status.content_key();
        {
            let last = self.last.lock().expect("status writer lock poisoned");
            if last.as_ref() == Some(&key) {
                debug!("status unchanged — skipping write");
                return Ok(false);
            }
        }

        self.write(status)?;
        *self.last.lock().expect("status writer lock poisoned") = Some(key);
        Ok(true)
    }

    /// Unconditional write, used for the terminal "stopped" record.
    pub fn write(&self, status: &BridgeStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(status)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write status file {}", self.path.display()))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path().join("status.json"));

        let mut status = BridgeStatus::running(42);
        status
            .components
            .insert("mailbox".into(), ComponentHealth::up());

        assert!(writer.write_if_changed(&status).unwrap());

        // Same content, fresh heartbeat and uptime: no write.
        status.updated_at = now_rfc3339();
        status.uptime_secs += 5;
        assert!(!writer.write_if_changed(&status).unwrap());

        // Content change: write again.
        status.pending.push("entry-1".into());
        assert!(writer.write_if_changed(&status).unwrap());
    }

    #[test]
    fn written_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path().join("status.json"));
        let status = BridgeStatus::running(7);
        writer.write(&status).unwrap();

        let raw = std::fs::read_to_string(writer.path()).unwrap();
        let back: BridgeStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.pid, 7);
        assert_eq!(back.status, "running");
    }
}
