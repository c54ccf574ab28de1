//! File-system-mediated mailbox between two processes that share only a
//! mounted directory tree.

pub mod bridge;
pub mod model;
pub mod status;
pub mod watcher;

pub use bridge::MailboxBridge;
pub use model::{ActionEntry, ActionStatus, SessionClaim};
pub use status::{BridgeStatus, ComponentHealth, StatusWriter};
