//! ACME client interface and the on-disk certificate store.
//!
//! The protocol work itself is delegated to the `instant-acme` crate; this
//! crate adapts it behind the [`AcmeClient`] trait so lineage processing can
//! be exercised against a mock.

mod client;
mod instant;
mod store;
pub mod types;

pub use client::AcmeClient;
pub use instant::InstantAcmeClient;
pub use store::LineageStore;
pub use types::{AcmeError, AcmeResult, CertificateBundle, LineageMetadata};
