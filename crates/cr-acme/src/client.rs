use crate::types::{AcmeResult, CertificateBundle};
use async_trait::async_trait;
use cr_common::config::Lineage;
use cr_dns::ChallengeAttempt;

/// The ACME protocol client, consumed as an opaque collaborator.
///
/// The implementation drives order creation, hands the DNS-01 challenge
/// records to `attempt` for publication and propagation, and finalizes
/// issuance. Whatever the outcome, it must call `attempt.cleanup()` before
/// returning so no challenge record outlives the attempt.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    async fn request_certificate(
        &self,
        lineage: &Lineage,
        attempt: &mut ChallengeAttempt,
    ) -> AcmeResult<CertificateBundle>;
}
