//! Tool transport: newline-delimited JSON-RPC 2.0 over a duplex byte stream.
//!
//! One connected peer; methods `initialize`, `ping`, `tools/list`,
//! `tools/call`.  Protocol version 2024-11-05.
//!
//! | Module | Role |
//! |--------|------|
//! | `transport` | Wire types, error codes, lifecycle handlers |
//! | `server` | Line-framed read loop and method dispatch |

pub mod server;
pub mod transport;

pub use server::RpcServer;
pub use transport::{
    handle_initialize, handle_ping, RpcError, RpcMessage, RpcResponse, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
};
