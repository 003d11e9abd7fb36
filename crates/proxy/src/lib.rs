//! Proxy core: forwards MCP JSON-RPC traffic to an IAM-protected endpoint.
//!
//! [`ProxyContext`] owns the per-instance state (token manager, session) and
//! exposes the request/notification handlers; [`run_stdio`] drives them from
//! a newline-delimited JSON stream.

mod context;
pub mod error;
mod handler;
pub mod session;
pub mod stdio;

#[cfg(test)]
mod testing;

pub use context::ProxyContext;
pub use handler::validate_response;
pub use session::{SESSION_HEADER, SessionManager};
pub use stdio::run_stdio;
