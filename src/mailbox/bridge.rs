//! Mailbox bridge: file-mediated, at-least-once message passing between two
//! processes that share only a mounted directory tree.
//!
//! Two independent event sources — the directory watcher and a fixed-interval
//! backstop poll — feed one idempotent `process_path` operation keyed by
//! entry id.  The status field inside the entry file is the idempotency
//! guard: only `pending` entries are acted on, and the `pending → processing`
//! rewrite lands before any handler side effect runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::model::{ActionEntry, ActionStatus};
use super::status::{BridgeStatus, ComponentHealth};
use super::watcher;
use crate::tools::ToolError;
use crate::AppContext;

// ─── MailboxBridge ────────────────────────────────────────────────────────────

pub struct MailboxBridge {
    ctx: Arc<AppContext>,
    dir: PathBuf,
    /// Ids currently being processed by this process.  Guards against the
    /// watcher and the poll racing on the same file before the `processing`
    /// rewrite lands.
    inflight: Mutex<HashSet<String>>,
}

impl MailboxBridge {
    pub fn new(ctx: Arc<AppContext>) -> Arc<Self> {
        let dir = ctx.config.mailbox_dir();
        Arc::new(Self {
            ctx,
            dir,
            inflight: Mutex::new(HashSet::new()),
        })
    }

    /// Start all recurring bridge activities as background tasks: watcher
    /// pump, backstop poll, status heartbeat, and session-token sweep.
    pub fn spawn(self: &Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create mailbox directory {}", self.dir.display()))?;

        let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
        let watcher_ok = match watcher::spawn(self.dir.clone(), tx) {
            Ok(()) => true,
            Err(e) => {
                // The poll still covers us; the aggregate status reports the
                // degraded watcher.
                warn!(err = %e, "mailbox watcher failed to start — poll only");
                false
            }
        };

        // Watch-event consumer.
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                bridge.process_path(&path).await;
            }
        });

        // Backstop poll: leftover pending entries at startup, dropped watch
        // events, and grace-period reaping.
        let bridge = Arc::clone(self);
        let poll = Duration::from_secs(self.ctx.config.timing.poll_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                bridge.scan().await;
                tokio::time::sleep(poll).await;
            }
        });

        // Status heartbeat.
        let bridge = Arc::clone(self);
        let heartbeat = Duration::from_secs(self.ctx.config.timing.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                let status = bridge.snapshot(watcher_ok);
                if let Err(e) = bridge.ctx.status.write_if_changed(&status) {
                    warn!(err = %e, "failed to write aggregate status");
                }
                tokio::time::sleep(heartbeat).await;
            }
        });

        // Expired session-token sweep, independent of any request.
        let ctx = Arc::clone(&self.ctx);
        let sweep = Duration::from_secs(self.ctx.config.auth.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep).await;
                if let Err(e) = ctx.auth.sweep() {
                    warn!(err = %e, "session token sweep failed");
                }
            }
        });

        info!(path = %self.dir.display(), "mailbox bridge started");
        Ok(())
    }

    // ── Entry processing ──────────────────────────────────────────────────────

    /// Process one observed file if (and only if) it holds a pending entry.
    ///
    /// Idempotent under duplicate, repeated, or out-of-order triggers from
    /// either event source.
    pub async fn process_path(&self, path: &Path) {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return;
        }

        // Settle window: the file may still be mid-write when first observed.
        let Some(raw) = self.read_settled(path).await else {
            return;
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                // Never destroy unparseable input — leave it for inspection.
                warn!(path = %path.display(), err = %e, "unparseable mailbox entry — left untouched");
                return;
            }
        };

        let entry: ActionEntry = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                self.mark_invalid(path, value, &e.to_string()).await;
                return;
            }
        };

        if entry.status != ActionStatus::Pending {
            debug!(id = %entry.id, status = ?entry.status, "entry not pending — skipped");
            return;
        }

        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            if !inflight.insert(entry.id.clone()) {
                debug!(id = %entry.id, "entry already in flight — skipped");
                return;
            }
        }

        self.run_entry(path, entry).await;
    }

    /// Drive one pending entry through `processing` to a terminal state.
    async fn run_entry(&self, path: &Path, mut entry: ActionEntry) {
        info!(id = %entry.id, action = %entry.action, "processing mailbox entry");

        // The processing rewrite is the cross-process idempotency marker; it
        // must land before any handler side effect.
        entry.status = ActionStatus::Processing;
        if let Err(e) = write_entry(path, &entry) {
            warn!(id = %entry.id, err = %e, "failed to mark entry processing");
            self.clear_inflight(&entry.id);
            return;
        }

        match self.authorize(&entry) {
            Ok(()) => match self.dispatch(&entry).await {
                Ok(result) => entry.complete(result),
                Err(message) => entry.fail(message),
            },
            Err(message) => {
                // Rejected outright — the action never executes.
                warn!(id = %entry.id, "authentication failure: {message}");
                entry.fail(message);
            }
        }

        match entry.status {
            ActionStatus::Completed => info!(id = %entry.id, "entry completed"),
            _ => warn!(id = %entry.id, error = entry.error.as_deref().unwrap_or(""), "entry failed"),
        }

        if let Err(e) = write_entry(path, &entry) {
            warn!(id = %entry.id, err = %e, "failed to write terminal entry");
        } else {
            self.schedule_delete(path.to_path_buf(), entry.id.clone());
        }
        self.clear_inflight(&entry.id);
    }

    /// Verify the entry's session claim, if policy or the entry demands one.
    fn authorize(&self, entry: &ActionEntry) -> std::result::Result<(), String> {
        match (&entry.session, self.ctx.config.auth.require_auth) {
            (None, false) => Ok(()),
            (None, true) => Err("authentication required: entry carries no session claim".into()),
            (Some(claim), _) => {
                if self.ctx.auth.verify(&claim.session_id, &claim.token) {
                    Ok(())
                } else {
                    Err(format!(
                        "authentication failed for session '{}'",
                        claim.session_id
                    ))
                }
            }
        }
    }

    /// Dispatch through the shared tool registry.  Errors are flattened to
    /// the descriptive string recorded on the failed entry.
    async fn dispatch(&self, entry: &ActionEntry) -> std::result::Result<Value, String> {
        let params = match &entry.params {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        self.ctx
            .registry
            .dispatch(&entry.action, params)
            .await
            .map_err(|e| match e {
                ToolError::NotFound(name) => format!("unknown action: {name}"),
                other => other.to_string(),
            })
    }

    /// An entry that is valid JSON but not a valid entry (missing `id` or
    /// `action`) is marked failed in place, preserving the producer's fields.
    async fn mark_invalid(&self, path: &Path, value: Value, reason: &str) {
        let Value::Object(mut fields) = value else {
            warn!(path = %path.display(), "mailbox entry is not a JSON object — left untouched");
            return;
        };

        // The rewrite below re-triggers the watcher, and the rewritten file
        // still fails entry validation, so the stamped terminal status must
        // act as the idempotency guard here just as it does for well-formed
        // entries.
        if is_terminal_str(fields.get("status").and_then(|v| v.as_str())) {
            debug!(path = %path.display(), "invalid entry already marked failed — skipped");
            return;
        }

        warn!(path = %path.display(), reason, "invalid mailbox entry — marking failed");
        fields.insert("status".into(), Value::String("failed".into()));
        fields.insert(
            "error".into(),
            Value::String(format!("invalid mailbox entry: {reason}")),
        );
        fields.insert(
            "completedAt".into(),
            Value::String(super::model::now_rfc3339()),
        );

        let id = fields
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| file_stem(path));
        if let Err(e) = write_json(path, &Value::Object(fields)) {
            warn!(path = %path.display(), err = %e, "failed to mark entry failed");
        } else {
            self.schedule_delete(path.to_path_buf(), id);
        }
    }

    // ── Poll / reap ───────────────────────────────────────────────────────────

    /// One backstop pass over the mailbox directory: process anything
    /// pending, reap terminal entries whose grace period has passed.
    pub async fn scan(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(err = %e, "cannot read mailbox directory");
                return;
            }
        };

        let grace = self.ctx.config.timing.grace_period_secs;
        for dirent in entries.flatten() {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Status comes from the raw fields, not the parsed entry, so
            // that files which failed validation (still plain JSON objects
            // with a stamped terminal status) reap like any other terminal
            // file.
            let Some(value) = read_value(&path) else {
                continue;
            };
            match value.get("status").and_then(|v| v.as_str()) {
                Some("completed") | Some("failed") => {
                    let completed_at = value.get("completedAt").and_then(|v| v.as_str());
                    if grace_elapsed(completed_at, grace) {
                        debug!(path = %path.display(), "grace period elapsed — removing entry file");
                        let _ = std::fs::remove_file(&path);
                    }
                }
                Some("processing") => {}
                // Pending, absent (defaults to pending), or unrecognized —
                // process_path settles it.
                _ => self.process_path(&path).await,
            }
        }
    }

    /// Snapshot for the aggregate status file.
    pub fn snapshot(&self, watcher_ok: bool) -> BridgeStatus {
        let mut status = BridgeStatus::running(std::process::id());
        status.uptime_secs = self.ctx.started_at.elapsed().as_secs();

        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for dirent in entries.flatten() {
                let path = dirent.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(value) = read_value(&path) else {
                    continue;
                };
                let id = value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| file_stem(&path));
                if is_terminal_str(value.get("status").and_then(|v| v.as_str())) {
                    status.completed.push(id);
                } else {
                    status.pending.push(id);
                }
            }
        }
        status.pending.sort();
        status.completed.sort();

        status.components.insert(
            "watcher".into(),
            if watcher_ok {
                ComponentHealth::up()
            } else {
                ComponentHealth::down("watch failed at startup; poll backstop only")
            },
        );
        status
            .components
            .insert("mailbox".into(), ComponentHealth::up());
        status
            .components
            .insert("auth".into(), ComponentHealth::up());
        status
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Read a just-observed file, retrying over the settle window in case the
    /// producer's write has not finished flushing.
    async fn read_settled(&self, path: &Path) -> Option<String> {
        let retries = self.ctx.config.timing.settle_retries.max(1);
        let delay = Duration::from_millis(self.ctx.config.timing.settle_delay_ms);
        for attempt in 0..retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match tokio::fs::read_to_string(path).await {
                Ok(raw) if !raw.trim().is_empty() => return Some(raw),
                // Empty reads happen mid-write; retry.
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Already reaped or renamed away; nothing to do.
                    return None;
                }
                Err(_) => continue,
            }
        }
        debug!(path = %path.display(), "file never settled — leaving for the next poll");
        None
    }

    /// Delete a terminal entry file after the grace period, giving the
    /// producer time to observe the terminal write.
    fn schedule_delete(&self, path: PathBuf, id: String) {
        let grace = Duration::from_secs(self.ctx.config.timing.grace_period_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // Only remove what is still terminal; a producer may have
            // replaced the file with a fresh request in the meantime.  The
            // raw-field check also covers marked-invalid files, which never
            // parse as entries.
            let still_terminal = read_value(&path)
                .map(|v| is_terminal_str(v.get("status").and_then(|s| s.as_str())))
                .unwrap_or(false);
            if still_terminal {
                debug!(id = %id, "removing terminal entry after grace period");
                let _ = std::fs::remove_file(&path);
            }
        });
    }

    fn clear_inflight(&self, id: &str) {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(id);
    }
}

// ─── File helpers ─────────────────────────────────────────────────────────────

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn read_value(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Terminal check on the raw `status` field, matching the serde lowercase
/// encoding.  Works for marked-invalid files too, which carry the stamped
/// status but never deserialize as entries.
fn is_terminal_str(status: Option<&str>) -> bool {
    matches!(status, Some("completed") | Some("failed"))
}

/// Atomic from the observer's point of view: write a sibling `.tmp` file,
/// then rename over the target.  `.tmp` files never match the watcher's
/// extension filter.
fn write_json(path: &Path, value: &Value) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename over {}", path.display()))
}

/// Producer-side helper as well: `send` writes its pending entry through
/// the same tmp-then-rename path the consumer uses.
pub fn write_entry(path: &Path, entry: &ActionEntry) -> Result<()> {
    write_json(path, &serde_json::to_value(entry)?)
}

fn grace_elapsed(completed_at: Option<&str>, grace_secs: u64) -> bool {
    let Some(completed_at) = completed_at else {
        return false;
    };
    let Ok(completed_at) = DateTime::parse_from_rfc3339(completed_at) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(completed_at.with_timezone(&Utc));
    age.num_seconds() >= grace_secs as i64
}
