//! Single-instance enforcement via a pid lock file.
//!
//! The hosting environment may launch a new bridge without having terminated
//! a stale one, so acquisition probes whether the recorded pid is still alive
//! before deciding.  No OS-level file locking is used — the lock file is a
//! plain JSON record readable from either side of the boundary.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

// ─── LockRecord ───────────────────────────────────────────────────────────────

/// On-disk lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub role: String,
    pub created_at: String,
}

/// Outcome of a lock acquisition.  Contention is an expected result, not an
/// error — callers holding `AlreadyRunning` should exit quietly.
#[derive(Debug)]
pub enum Acquired {
    /// We hold the lock.  Keep the guard alive for the process lifetime.
    Held(LockGuard),
    /// A live process already serves this role.
    AlreadyRunning { pid: u32 },
}

// ─── Liveness probe ───────────────────────────────────────────────────────────

/// Whether a process with this pid currently exists.  Zero-effect probe that
/// needs no elevated permission: it only reads the process table.
pub fn pid_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    sys.process(target).is_some()
}

// ─── Acquisition ──────────────────────────────────────────────────────────────

/// Try to acquire the instance lock for `role` under `data_dir`.
///
/// An existing record whose pid is alive yields `AlreadyRunning`.  A record
/// whose pid is dead is stale and reclaimed.  A record that cannot be parsed
/// is treated as stale — a corrupt lock file must not wedge the role forever.
pub fn acquire(data_dir: &Path, role: &str) -> Result<Acquired> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data directory {}", data_dir.display()))?;
    let path = data_dir.join(format!("{role}.lock.json"));

    // One retry: if another process wins the create_new race below we
    // re-probe the record it wrote.
    for _ in 0..2 {
        match read_record(&path) {
            Some(rec) if pid_alive(rec.pid) => {
                debug!(role, pid = rec.pid, "lock held by live process");
                return Ok(Acquired::AlreadyRunning { pid: rec.pid });
            }
            Some(rec) => {
                warn!(role, pid = rec.pid, "reclaiming stale lock from dead process");
                let _ = std::fs::remove_file(&path);
            }
            None if path.exists() => {
                warn!(role, path = %path.display(), "unreadable lock file — reclaiming");
                let _ = std::fs::remove_file(&path);
            }
            None => {}
        }

        let record = LockRecord {
            pid: std::process::id(),
            role: role.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        // create_new keeps the stale-reclaim race window to a single syscall:
        // if two acquirers race, exactly one create succeeds.
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())
                    .with_context(|| format!("write lock file {}", path.display()))?;
                info!(role, pid = record.pid, "instance lock acquired");
                return Ok(Acquired::Held(LockGuard {
                    path,
                    pid: record.pid,
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the race — loop once and probe the winner's record.
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create lock file {}", path.display()));
            }
        }
    }

    // Both attempts lost the race; whoever won is alive by definition.
    let pid = read_record(&path).map(|r| r.pid).unwrap_or(0);
    Ok(Acquired::AlreadyRunning { pid })
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

// ─── LockGuard ────────────────────────────────────────────────────────────────

/// Releases the lock on drop.  The file is removed only if it still carries
/// our pid, so a reclaimer that raced us is never clobbered.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release for signal-handling paths; idempotent.
    pub fn release(&self) {
        match read_record(&self.path) {
            Some(rec) if rec.pid == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), err = %e, "failed to remove lock file");
                } else {
                    info!(pid = self.pid, "instance lock released");
                }
            }
            _ => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // A pid that can safely be assumed dead: the max value most kernels
    // never allocate.
    const DEAD_PID: u32 = u32::MAX - 7;

    #[test]
    fn acquire_then_contend() {
        let dir = tempfile::tempdir().unwrap();
        let first = acquire(dir.path(), "bridge").unwrap();
        let guard = match first {
            Acquired::Held(g) => g,
            other => panic!("expected Held, got {other:?}"),
        };

        // Second acquisition sees our own live pid.
        match acquire(dir.path(), "bridge").unwrap() {
            Acquired::AlreadyRunning { pid } => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        drop(guard);
        assert!(!dir.path().join("bridge.lock.json").exists());
    }

    #[test]
    fn stale_record_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock.json");
        let stale = LockRecord {
            pid: DEAD_PID,
            role: "bridge".to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        match acquire(dir.path(), "bridge").unwrap() {
            Acquired::Held(_) => {}
            other => panic!("expected reclaim, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock.json");
        std::fs::write(&path, "{not json").unwrap();

        match acquire(dir.path(), "bridge").unwrap() {
            Acquired::Held(_) => {}
            other => panic!("expected reclaim of corrupt record, got {other:?}"),
        }
    }

    #[test]
    fn roles_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = acquire(dir.path(), "bridge").unwrap();
        match acquire(dir.path(), "viewer").unwrap() {
            Acquired::Held(_) => {}
            other => panic!("different role should acquire, got {other:?}"),
        }
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(DEAD_PID));
    }
}
