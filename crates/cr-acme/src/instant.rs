use crate::client::AcmeClient;
use crate::store::LineageStore;
use crate::types::{AcmeError, AcmeResult, CertificateBundle};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use cr_common::config::{KeyProfile, Lineage};
use cr_dns::{ChallengeAttempt, ChallengeRecord};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(2);
// Let's Encrypt certificates are valid for 90 days
const CERT_LIFETIME_DAYS: i64 = 90;

/// Production ACME client backed by the `instant-acme` crate.
pub struct InstantAcmeClient {
    store: LineageStore,
    directory_url: String,
    contact_email: Option<String>,
    order_timeout: Duration,
    account: Mutex<Option<Account>>,
}

impl InstantAcmeClient {
    pub fn new(
        store: LineageStore,
        directory_url: String,
        contact_email: Option<String>,
        order_timeout: Duration,
    ) -> Self {
        Self {
            store,
            directory_url,
            contact_email,
            order_timeout,
            account: Mutex::new(None),
        }
    }

    /// Load the persisted account, or register a new one on first run.
    pub async fn init(&self) -> AcmeResult<()> {
        self.store.init()?;

        let account = if self.store.has_account() {
            self.load_account().await?
        } else {
            self.create_account().await?
        };

        *self.account.lock().await = Some(account);
        info!("ACME account ready");
        Ok(())
    }

    async fn create_account(&self) -> AcmeResult<Account> {
        info!(directory = %self.directory_url, "Registering new ACME account");

        let contact: Vec<String> = self
            .contact_email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Protocol(format!("failed to create account: {e}")))?;

        let creds_json = serde_json::to_string_pretty(&credentials)?;
        self.store.write_account(&creds_json)?;

        info!("Registered new ACME account");
        Ok(account)
    }

    async fn load_account(&self) -> AcmeResult<Account> {
        debug!("Loading persisted ACME account");

        let creds_json = self.store.read_account()?;
        let credentials: AccountCredentials = serde_json::from_str(&creds_json)?;

        Account::from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::Protocol(format!("failed to load account: {e}")))
    }

    /// Publish challenge records, notify the ACME server, and wait for the
    /// order to become ready. Challenge records stay up throughout; the
    /// caller cleans them up whatever this returns.
    async fn validate_order(
        &self,
        order: &mut Order,
        attempt: &mut ChallengeAttempt,
        deadline: Instant,
    ) -> AcmeResult<()> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::Protocol(format!("failed to get authorizations: {e}")))?;

        let mut records = Vec::new();
        let mut challenge_urls = Vec::new();

        for auth in &authorizations {
            if auth.status == AuthorizationStatus::Valid {
                debug!("Authorization already valid, skipping");
                continue;
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    AcmeError::OrderFailed("no DNS-01 challenge offered".into())
                })?;

            let domain = match &auth.identifier {
                Identifier::Dns(d) => d.clone(),
            };

            let key_auth = order.key_authorization(challenge);
            records.push(ChallengeRecord::for_domain(&domain, &key_auth.dns_value()));
            challenge_urls.push(challenge.url.clone());
        }

        if records.is_empty() {
            return Ok(());
        }

        attempt.present(&records).await?;

        for url in &challenge_urls {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| AcmeError::Protocol(format!("failed to set challenge ready: {e}")))?;
        }

        // Wait for the ACME server to validate
        loop {
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
            order
                .refresh()
                .await
                .map_err(|e| AcmeError::Protocol(format!("failed to refresh order: {e}")))?;

            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => {
                    debug!("Order validated");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::OrderFailed("order became invalid".into()));
                }
                status => {
                    debug!(status = ?status, "Order not ready yet");
                    if Instant::now() >= deadline {
                        return Err(AcmeError::OrderTimeout("ready"));
                    }
                }
            }
        }
    }

    async fn finalize_order(
        &self,
        order: &mut Order,
        lineage: &Lineage,
        deadline: Instant,
    ) -> AcmeResult<(rcgen::KeyPair, String)> {
        let mut params = rcgen::CertificateParams::new(lineage.domains.clone())
            .map_err(|e| AcmeError::Protocol(format!("failed to build cert params: {e}")))?;
        params.distinguished_name = rcgen::DistinguishedName::new();

        let key_pair = match lineage.key_profile {
            KeyProfile::EcdsaP256 => rcgen::KeyPair::generate(),
            KeyProfile::EcdsaP384 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
        }
        .map_err(|e| AcmeError::Protocol(format!("failed to generate key pair: {e}")))?;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::Protocol(format!("failed to build CSR: {e}")))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| AcmeError::Protocol(format!("failed to finalize order: {e}")))?;

        let chain = loop {
            tokio::time::sleep(CERT_POLL_INTERVAL).await;
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => {
                    debug!("Certificate not issued yet");
                    if Instant::now() >= deadline {
                        return Err(AcmeError::OrderTimeout("issued"));
                    }
                }
                Err(e) => {
                    return Err(AcmeError::Protocol(format!(
                        "failed to download certificate: {e}"
                    )));
                }
            }
        };

        Ok((key_pair, chain))
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn request_certificate(
        &self,
        lineage: &Lineage,
        attempt: &mut ChallengeAttempt,
    ) -> AcmeResult<CertificateBundle> {
        // Clone the account handle out of the lock; holding the guard across
        // an order would serialize every concurrent lineage on this mutex.
        let account = self
            .account
            .lock()
            .await
            .as_ref()
            .ok_or(AcmeError::NotInitialized)?
            .clone();

        info!(
            lineage = %lineage.name,
            domains = %lineage.domains.join(", "),
            "Requesting certificate"
        );

        let identifiers: Vec<Identifier> = lineage
            .domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::Protocol(format!("failed to create order: {e}")))?;

        let deadline = Instant::now() + self.order_timeout;

        // Challenge records must not outlive the validation attempt
        let validated = self.validate_order(&mut order, attempt, deadline).await;
        attempt.cleanup().await;
        validated?;

        let (key_pair, chain) = self.finalize_order(&mut order, lineage, deadline).await?;

        let now = Utc::now();
        let bundle = CertificateBundle {
            lineage: lineage.name.clone(),
            domains: lineage.domains.clone(),
            private_key_pem: key_pair.serialize_pem(),
            chain_pem: chain,
            issued_at: now,
            expires_at: now + ChronoDuration::days(CERT_LIFETIME_DAYS),
        };

        info!(
            lineage = %lineage.name,
            expires_at = %bundle.expires_at,
            "Certificate issued"
        );
        Ok(bundle)
    }
}
