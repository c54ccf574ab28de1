//! Filesystem watcher for the mailbox directory.
//!
//! notify callbacks run on a notify-internal thread; events are forwarded to
//! a tokio mpsc channel and consumed on the async executor.  The watcher is
//! one of two event sources (the backstop poll is the other) feeding the
//! same idempotent process-if-pending operation, so duplicated, repeated, or
//! out-of-order events are safe by construction.

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Start watching `dir` for entry files; observed paths are sent to `tx`.
///
/// Both creation and modification events are forwarded: a producer may write
/// in place, and the consumer's own terminal rewrite also fires here — the
/// status guard downstream makes that harmless.
pub fn spawn(dir: PathBuf, tx: mpsc::Sender<PathBuf>) -> Result<()> {
    let (raw_tx, mut raw_rx) = mpsc::channel::<std::result::Result<Event, notify::Error>>(64);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.blocking_send(res);
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;

    std::fs::create_dir_all(&dir)?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %dir.display(), "watching mailbox directory");

    tokio::spawn(async move {
        // Keep the watcher alive for the duration of the spawned task.
        let _watcher = watcher;

        while let Some(event_res) = raw_rx.recv().await {
            match event_res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }
                    for path in event.paths {
                        if path.extension().and_then(|e| e.to_str()) == Some("json") {
                            if tx.send(path).await.is_err() {
                                // Consumer gone — the bridge is shutting down.
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(err = %e, "mailbox watcher error");
                }
            }
        }
    });

    Ok(())
}
