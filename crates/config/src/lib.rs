//! Configuration loading for the idgate proxy.
//!
//! Uses figment to layer defaults, an optional YAML file and `IDGATE_*`
//! environment variables; CLI flags are applied on top by the binary.

pub mod schema;

pub use schema::{Config, ConfigError, LogConfig, LogFormat, UpstreamSettings};
