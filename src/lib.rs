pub mod auth;
pub mod config;
pub mod lock;
pub mod mailbox;
pub mod mcp;
pub mod tools;

use std::sync::Arc;

use auth::SessionAuthenticator;
use config::BridgeConfig;
use mailbox::status::StatusWriter;
use tools::ToolRegistry;

/// Shared application state passed to the transport loop and the mailbox
/// bridge.  Constructed once at startup; lives for the process lifetime.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<BridgeConfig>,
    /// The full set of callable tools.  Built-ins plus anything discovered
    /// at startup; immutable after construction.
    pub registry: Arc<ToolRegistry>,
    /// Issues and verifies session bearer tokens for mailbox requests that
    /// cross the trust boundary.
    pub auth: Arc<SessionAuthenticator>,
    /// Aggregate status file writer (best-effort cache for external status
    /// queries).
    pub status: Arc<StatusWriter>,
    pub started_at: std::time::Instant,
}
