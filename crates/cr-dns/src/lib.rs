//! DNS-01 challenge plumbing: provider plugins that publish TXT records and
//! the coordinator that verifies propagation before validation proceeds.

pub mod challenge;
pub mod cloudflare;
pub mod provider;
pub mod resolver;

pub use challenge::{ChallengeAttempt, ChallengeError, ChallengeRecord, PropagationSettings};
pub use cloudflare::CloudflareProvider;
pub use provider::{DefaultProviderFactory, DnsProvider, ProviderError, ProviderFactory};
pub use resolver::{SystemResolver, TxtResolver};
