//! Identity token acquisition for the idgate proxy.
//!
//! [`AdcProvider`] discovers Application Default Credentials and hands out
//! per-audience minting clients; [`TokenManager`] caches the tokens they mint
//! and decides when a new one is needed.

pub mod adc;
pub mod cache;
pub mod manager;
pub mod metadata;
pub mod service_account;

pub use adc::{AdcProvider, CredentialSource, Discovery};
pub use cache::TokenCache;
pub use manager::{TokenManager, validate_audience};
pub use metadata::MetadataServer;
pub use service_account::ServiceAccountKey;
