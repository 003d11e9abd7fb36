//! HTTP transport to the protected MCP server.

pub mod transport;

pub use transport::{ReqwestTransport, build_client};
