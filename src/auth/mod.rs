//! Short-lived bearer tokens for mailbox requests that cross the trust
//! boundary.
//!
//! Neither side can authenticate the other by process identity — only a
//! mounted directory tree is shared — so a producer proves it belongs to a
//! session by presenting the token minted for that session id.  The store is
//! a plain JSON file on the shared tree; read-modify-write with no
//! cross-process locking (last writer wins, an accepted weakness).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

// ─── SessionRecord ────────────────────────────────────────────────────────────

/// One entry in the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub token: String,
    pub created_at: String,
    pub expires_at: String,
}

type Store = BTreeMap<String, SessionRecord>;

// ─── SessionAuthenticator ─────────────────────────────────────────────────────

/// Issues and verifies opaque session tokens backed by a shared JSON file.
pub struct SessionAuthenticator {
    store_path: PathBuf,
    ttl: Duration,
}

impl SessionAuthenticator {
    pub fn new(store_path: PathBuf, ttl_secs: u64) -> Self {
        Self {
            store_path,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Mint a fresh token for `session_id` and persist it.
    ///
    /// Re-creating an existing session replaces its token — the old one
    /// stops verifying immediately.
    pub fn create(&self, session_id: &str) -> Result<SessionRecord> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        let now = Utc::now();
        let record = SessionRecord {
            token: hex::encode(bytes),
            created_at: now.to_rfc3339(),
            expires_at: (now + self.ttl).to_rfc3339(),
        };

        let mut store = self.load();
        store.insert(session_id.to_string(), record.clone());
        self.save(&store)?;
        debug!(session = session_id, "session token issued");
        Ok(record)
    }

    /// True iff a record exists for `session_id`, the token matches exactly,
    /// and the current time precedes expiry.  No prefix or partial match.
    pub fn verify(&self, session_id: &str, token: &str) -> bool {
        let store = self.load();
        let Some(record) = store.get(session_id) else {
            return false;
        };
        if record.token != token {
            return false;
        }
        match parse_rfc3339(&record.expires_at) {
            Some(expires_at) => Utc::now() < expires_at,
            None => false,
        }
    }

    /// Remove all expired records.  Returns the number removed.  Runs on a
    /// fixed schedule, independent of any request.
    pub fn sweep(&self) -> Result<usize> {
        let mut store = self.load();
        let now = Utc::now();
        let before = store.len();
        store.retain(|_, record| match parse_rfc3339(&record.expires_at) {
            Some(expires_at) => now < expires_at,
            // An unparseable expiry never matches; purge it too.
            None => false,
        });
        let removed = before - store.len();
        if removed > 0 {
            self.save(&store)?;
            debug!(removed, "swept expired session tokens");
        }
        Ok(removed)
    }

    // ── Store I/O ─────────────────────────────────────────────────────────────

    fn load(&self) -> Store {
        match std::fs::read_to_string(&self.store_path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(store) => store,
                Err(e) => {
                    warn!(
                        path = %self.store_path.display(),
                        err = %e,
                        "corrupt session store — treating as empty"
                    );
                    Store::new()
                }
            },
            Err(_) => Store::new(),
        }
    }

    fn save(&self, store: &Store) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(store)?;
        std::fs::write(&self.store_path, raw)
            .with_context(|| format!("write session store {}", self.store_path.display()))?;

        // The token is a credential: owner read/write only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &self.store_path,
                std::fs::Permissions::from_mode(0o600),
            );
        }
        Ok(())
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator(dir: &std::path::Path, ttl_secs: u64) -> SessionAuthenticator {
        SessionAuthenticator::new(dir.join("sessions.json"), ttl_secs)
    }

    #[test]
    fn create_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticator(dir.path(), 3600);
        let record = auth.create("sess-1").unwrap();

        assert_eq!(record.token.len(), 64, "32 bytes hex-encoded");
        assert!(auth.verify("sess-1", &record.token));
        assert!(!auth.verify("sess-1", "wrong-token"));
        assert!(!auth.verify("sess-2", &record.token));
    }

    #[test]
    fn no_prefix_match() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticator(dir.path(), 3600);
        let record = auth.create("sess-1").unwrap();
        let prefix = &record.token[..record.token.len() - 1];
        assert!(!auth.verify("sess-1", prefix));
        assert!(!auth.verify("sess-1", &format!("{}x", record.token)));
    }

    #[test]
    fn expired_token_never_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticator(dir.path(), 0);
        let record = auth.create("sess-1").unwrap();
        assert!(!auth.verify("sess-1", &record.token));
    }

    #[test]
    fn sweep_removes_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let expired = authenticator(dir.path(), 0);
        expired.create("old").unwrap();

        let live = authenticator(dir.path(), 3600);
        let record = live.create("new").unwrap();

        let removed = live.sweep().unwrap();
        assert_eq!(removed, 1);
        assert!(!live.verify("old", "anything"));
        assert!(live.verify("new", &record.token));
    }

    #[test]
    fn recreate_replaces_token() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticator(dir.path(), 3600);
        let first = auth.create("sess-1").unwrap();
        let second = auth.create("sess-1").unwrap();
        assert_ne!(first.token, second.token);
        assert!(!auth.verify("sess-1", &first.token));
        assert!(auth.verify("sess-1", &second.token));
    }

    #[test]
    fn corrupt_store_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sessions.json"), "{oops").unwrap();
        let auth = authenticator(dir.path(), 3600);
        assert!(!auth.verify("sess-1", "token"));
        let record = auth.create("sess-1").unwrap();
        assert!(auth.verify("sess-1", &record.token));
    }
}
