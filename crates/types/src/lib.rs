//! Core types and traits for the idgate workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! proxy: the JSON-RPC message model, the error taxonomy, identity tokens,
//! and the async traits implemented by the credential and transport layers.

pub mod error;
pub mod jsonrpc;
pub mod token;
pub mod traits;

pub use error::{AuthError, ProxyError, ShapeError, UpstreamError};
pub use jsonrpc::{Message, Notification, Outcome, ProtocolError, Request, RequestId, Response};
pub use token::IdToken;
pub use traits::{
    CredentialProvider, HttpTransport, IdTokenClient, UpstreamRequest, UpstreamResponse,
};
