// ACME certificate authority client (DNS-01 only)

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use log::{debug, info};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use tokio::sync::RwLock;

use crate::error::AuthorityError;

use super::{
    authority::{CertificateAuthority, IssuedCertificate, Registration, RenewalWindow},
    bundle::AccountState,
    challenge::{ChallengeProvider, PublishedRecords},
};

/// Default Let's Encrypt production directory URL
pub const LETS_ENCRYPT_PRODUCTION_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory URL (for testing)
pub const LETS_ENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Field of the serialized account credentials that carries the key
const KEY_FIELD: &str = "key_pkcs8";

const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ORDER_POLL_MAX_INTERVAL: Duration = Duration::from_secs(30);
const ORDER_POLL_MAX_ATTEMPTS: u32 = 40;
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Certificate authority speaking ACME against a fixed directory
pub struct AcmeAuthority {
    directory_url: String,
    challenge: Arc<dyn ChallengeProvider>,
    account: RwLock<Option<Arc<Account>>>,
}

impl AcmeAuthority {
    pub fn new(directory_url: impl Into<String>, challenge: Arc<dyn ChallengeProvider>) -> Self {
        Self {
            directory_url: directory_url.into(),
            challenge,
            account: RwLock::new(None),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn session(&self, account: &AccountState) -> Result<Arc<Account>, AuthorityError> {
        if let Some(existing) = self.account.read().await.as_ref() {
            return Ok(Arc::clone(existing));
        }

        self.resume(account).await?;
        self.account
            .read()
            .await
            .clone()
            .ok_or(AuthorityError::NotRegistered)
    }

    /// Publish the DNS-01 records for every pending authorization
    async fn prepare_challenges(
        &self,
        order: &mut Order,
        records: &mut PublishedRecords,
    ) -> Result<Vec<String>, AuthorityError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AuthorityError::Order(format!("Failed to get authorizations: {e}")))?;

        let mut ready_urls = Vec::new();
        for auth in &authorizations {
            let Identifier::Dns(domain) = &auth.identifier;

            if matches!(auth.status, AuthorizationStatus::Valid) {
                debug!("Authorization for {domain} is already valid");
                continue;
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    AuthorityError::Challenge(format!("No DNS-01 challenge offered for {domain}"))
                })?;

            let name = format!("_acme-challenge.{}", domain.trim_start_matches("*."));
            let value = order.key_authorization(challenge).dns_value();

            let record = self.challenge.create_txt_record(&name, &value).await?;
            records.push(record);
            ready_urls.push(challenge.url.clone());
        }

        Ok(ready_urls)
    }

    async fn issue(
        &self,
        account: &Account,
        domains: &[String],
        records: &mut PublishedRecords,
    ) -> Result<IssuedCertificate, AuthorityError> {
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AuthorityError::Order(format!("Failed to create order: {e}")))?;

        let ready_urls = self.prepare_challenges(&mut order, records).await?;

        if !ready_urls.is_empty() {
            debug!("Waiting {:?} for DNS propagation", self.challenge.propagation_delay());
            tokio::time::sleep(self.challenge.propagation_delay()).await;

            for url in &ready_urls {
                order.set_challenge_ready(url).await.map_err(|e| {
                    AuthorityError::Challenge(format!("Failed to set challenge ready: {e}"))
                })?;
            }
        }

        wait_for_ready(&mut order).await?;

        let (csr, key_pair) = generate_csr(domains)?;
        order
            .finalize(&csr)
            .await
            .map_err(|e| AuthorityError::Issuance(format!("Failed to finalize order: {e}")))?;

        let chain = loop {
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => tokio::time::sleep(CERT_POLL_INTERVAL).await,
                Err(e) => {
                    return Err(AuthorityError::Issuance(format!(
                        "Failed to download certificate: {e}"
                    )));
                }
            }
        };

        Ok(IssuedCertificate {
            certificate_chain: chain,
            private_key: key_pair.serialize_pem(),
        })
    }
}

/// Poll the order until the authority has validated every challenge
async fn wait_for_ready(order: &mut Order) -> Result<(), AuthorityError> {
    let mut interval = ORDER_POLL_INTERVAL;

    for attempt in 1..=ORDER_POLL_MAX_ATTEMPTS {
        let state = order
            .refresh()
            .await
            .map_err(|e| AuthorityError::Order(format!("Failed to refresh order: {e}")))?;

        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                return Err(AuthorityError::Challenge("Order was rejected as invalid".to_string()));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                debug!("Order not ready yet (attempt {attempt}/{ORDER_POLL_MAX_ATTEMPTS})");
            }
        }

        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(ORDER_POLL_MAX_INTERVAL);
    }

    Err(AuthorityError::Challenge(format!(
        "Order still pending after {ORDER_POLL_MAX_ATTEMPTS} attempts"
    )))
}

/// ECDSA P-256 key and CSR with the first domain as common name
fn generate_csr(domains: &[String]) -> Result<(Vec<u8>, KeyPair), AuthorityError> {
    let key_pair = KeyPair::generate()
        .map_err(|e| AuthorityError::Issuance(format!("Failed to generate key pair: {e}")))?;

    let mut params = CertificateParams::default();
    if let Some(primary) = domains.first() {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, primary.clone());
        params.distinguished_name = dn;
    }

    params.subject_alt_names = domains
        .iter()
        .map(|d| {
            d.clone()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|e| AuthorityError::Issuance(format!("Invalid domain `{d}`: {e}")))
        })
        .collect::<Result<_, _>>()?;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AuthorityError::Issuance(format!("Failed to create CSR: {e}")))?;

    Ok((csr.der().to_vec(), key_pair))
}

/// Split serialized credentials into the stored handle and key
fn split_credentials(credentials: &AccountCredentials) -> Result<Registration, AuthorityError> {
    let mut value = serde_json::to_value(credentials)
        .map_err(|e| AuthorityError::Account(format!("Failed to serialize credentials: {e}")))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| AuthorityError::Account("Credentials are not an object".to_string()))?;

    let private_key = match object.remove(KEY_FIELD) {
        Some(serde_json::Value::String(key)) => key,
        _ => return Err(AuthorityError::Account("Credentials carry no account key".to_string())),
    };

    Ok(Registration {
        handle: value.to_string(),
        private_key,
    })
}

fn join_credentials(account: &AccountState) -> Result<AccountCredentials, AuthorityError> {
    let mut value: serde_json::Value = serde_json::from_str(&account.registration)
        .map_err(|e| AuthorityError::Account(format!("Malformed registration handle: {e}")))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| AuthorityError::Account("Registration handle is not an object".to_string()))?;
    object.insert(
        KEY_FIELD.to_string(),
        serde_json::Value::String(account.private_key.clone()),
    );

    serde_json::from_value(value)
        .map_err(|e| AuthorityError::Account(format!("Malformed account credentials: {e}")))
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn register(&self, email: &str) -> Result<Registration, AuthorityError> {
        let contact = if email.is_empty() {
            Vec::new()
        } else {
            vec![format!("mailto:{email}")]
        };
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        info!("Registering ACME account at {}", self.directory_url);
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
        .map_err(|e| AuthorityError::Account(format!("Failed to create account: {e}")))?;

        let registration = split_credentials(&credentials)?;
        *self.account.write().await = Some(Arc::new(account));

        Ok(registration)
    }

    async fn resume(&self, account: &AccountState) -> Result<(), AuthorityError> {
        let credentials = join_credentials(account)?;

        let restored = Account::from_credentials(credentials)
            .await
            .map_err(|e| AuthorityError::Account(format!("Failed to restore account: {e}")))?;

        debug!("Resumed ACME account session");
        *self.account.write().await = Some(Arc::new(restored));

        Ok(())
    }

    async fn obtain_certificate(
        &self,
        account: &AccountState,
        domains: &[String],
    ) -> Result<IssuedCertificate, AuthorityError> {
        let session = self.session(account).await?;

        info!("Requesting certificate for {domains:?}");
        let mut records = PublishedRecords::new(Arc::clone(&self.challenge));
        let result = self.issue(&session, domains, &mut records).await;
        records.remove_all().await;

        result
    }

    async fn suggested_renewal(
        &self,
        _account: &AccountState,
        _leaf: &[u8],
    ) -> Result<RenewalWindow, AuthorityError> {
        Err(AuthorityError::RenewalInfoUnsupported)
    }
}
