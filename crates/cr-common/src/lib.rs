//! Certroute shared types: configuration model, content digests, and
//! permission reconciliation for generated key material.

pub mod config;
pub mod digest;
pub mod error;
pub mod permissions;

pub use config::{ConfigSnapshot, EnvConfig, GlobalSettings, KeyProfile, Lineage, PermissionPolicy, ProviderConfig};
pub use digest::Digest;
pub use error::{ConfigError, PermissionError};
