// Account and certificate values shared by the store, the agent and the distributor

use std::{collections::BTreeSet, fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
};
use rustls_pemfile::{certs, private_key};
use serde::{Deserialize, Serialize};
use x509_parser::extensions::GeneralName;

use crate::error::BundleError;

/// Identity used with the certificate authority, persisted as `state.json`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub email: String,

    /// Opaque reference handed out by the authority at registration
    pub registration: String,

    /// PKCS#8 account key, base64url without padding
    pub private_key: String,
}

impl AccountState {
    pub fn new(email: impl Into<String>, registration: String, private_key: String) -> Self {
        Self {
            email: email.into(),
            registration,
            private_key,
        }
    }

    /// Decode the account key and make sure it is a usable signing key
    pub fn validate_key(&self) -> Result<(), BundleError> {
        let der = URL_SAFE_NO_PAD
            .decode(self.private_key.trim())
            .map_err(|e| BundleError::InvalidPrivateKey(format!("Account key is not base64url: {e}")))?;

        rcgen::KeyPair::try_from(der.as_slice())
            .map_err(|e| BundleError::InvalidPrivateKey(format!("Account key is not PKCS#8: {e}")))?;

        Ok(())
    }
}

impl fmt::Debug for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountState")
            .field("email", &self.email)
            .field("registration", &self.registration)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A certificate chain with its private key, handed around as one unit
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub domains: Vec<String>,

    /// PEM encoded leaf followed by its issuers
    pub certificate_chain: Vec<u8>,

    /// PEM encoded private key
    pub private_key: Vec<u8>,

    pub obtained_at: DateTime<Utc>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("domains", &self.domains)
            .field("certificate_chain", &format_args!("{} bytes", self.certificate_chain.len()))
            .field("private_key", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Validity information read from the leaf certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: String,
}

impl LeafInfo {
    /// Whether less than a third of the validity period is left at `now`
    pub fn in_final_third(&self, now: DateTime<Utc>) -> bool {
        let lifetime = self.not_after - self.not_before;
        let remaining = self.not_after - now;
        remaining * 3 < lifetime
    }
}

impl CertificateBundle {
    pub fn new(
        domains: Vec<String>,
        certificate_chain: impl Into<Vec<u8>>,
        private_key: impl Into<Vec<u8>>,
        obtained_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domains,
            certificate_chain: certificate_chain.into(),
            private_key: private_key.into(),
            obtained_at,
        }
    }

    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    /// Parse the PEM chain into DER certificates
    pub fn certificates(&self) -> Result<Vec<CertificateDer<'static>>, BundleError> {
        let mut reader = self.certificate_chain.as_slice();
        let chain = certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BundleError::InvalidCertificate(e.to_string()))?;

        if chain.is_empty() {
            return Err(BundleError::EmptyChain);
        }

        return Ok(chain);
    }

    /// Parse the PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub fn key(&self) -> Result<PrivateKeyDer<'static>, BundleError> {
        let mut reader = self.private_key.as_slice();
        private_key(&mut reader)
            .map_err(|e| BundleError::InvalidPrivateKey(e.to_string()))?
            .ok_or_else(|| BundleError::InvalidPrivateKey("No private key found".to_string()))
    }

    /// The DER encoded leaf certificate
    pub fn leaf(&self) -> Result<CertificateDer<'static>, BundleError> {
        let mut chain = self.certificates()?;
        Ok(chain.swap_remove(0))
    }

    /// Build the signing material rustls serves during a handshake
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, BundleError> {
        let chain = self.certificates()?;
        let key = self.key()?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| BundleError::InvalidPrivateKey(e.to_string()))?;

        let certified_key = CertifiedKey::new(chain, signing_key);
        if let Err(e) = certified_key.keys_match() {
            return Err(BundleError::InvalidPrivateKey(format!(
                "Private key does not match the certificate: {e}"
            )));
        }

        return Ok(Arc::new(certified_key));
    }

    /// Read validity and serial number from the leaf certificate
    pub fn leaf_info(&self) -> Result<LeafInfo, BundleError> {
        let leaf = self.leaf()?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| BundleError::InvalidCertificate(e.to_string()))?;

        let validity = cert.validity();
        Ok(LeafInfo {
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
            serial: cert.tbs_certificate.raw_serial_as_string(),
        })
    }

    /// DNS names the leaf certificate is valid for, lowercased
    pub fn leaf_domains(&self) -> Result<BTreeSet<String>, BundleError> {
        let leaf = self.leaf()?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| BundleError::InvalidCertificate(e.to_string()))?;

        let mut domains = BTreeSet::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in san.value.general_names.iter() {
                if let GeneralName::DNSName(dns_name) = name {
                    domains.insert(normalize_domain(dns_name));
                }
            }
        }

        Ok(domains)
    }

    /// Whether the leaf names exactly `domains`, ignoring order and case
    pub fn covers_exactly(&self, domains: &[String]) -> Result<bool, BundleError> {
        let wanted: BTreeSet<String> = domains.iter().map(|d| normalize_domain(d)).collect();
        Ok(self.leaf_domains()? == wanted)
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, BundleError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BundleError::InvalidCertificate(format!("Timestamp out of range: {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn init_crypto() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    fn self_signed(domain: &str) -> CertificateBundle {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        CertificateBundle::new(
            vec![domain.to_string()],
            cert.pem(),
            key_pair.serialize_pem(),
            Utc::now(),
        )
    }

    #[test]
    fn test_certified_key_from_bundle() {
        init_crypto();
        let bundle = self_signed("kms.example.com");

        let certified = bundle.certified_key();
        assert!(certified.is_ok(), "Failed to build certified key: {:?}", certified.err());
        assert_eq!(certified.unwrap().cert.len(), 1);
    }

    #[test]
    fn test_mismatched_key_rejected() {
        init_crypto();
        let a = self_signed("a.example.com");
        let b = self_signed("b.example.com");
        let mixed = CertificateBundle::new(a.domains.clone(), a.certificate_chain, b.private_key, Utc::now());

        assert!(matches!(mixed.certified_key(), Err(BundleError::InvalidPrivateKey(_))));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let bundle = CertificateBundle::new(vec!["x".to_string()], "not a certificate", "", Utc::now());
        assert!(matches!(bundle.certificates(), Err(BundleError::EmptyChain)));
        assert!(bundle.key().is_err());
    }

    #[test]
    fn test_leaf_info() {
        let bundle = self_signed("kms.example.com");
        let info = bundle.leaf_info().unwrap();

        assert!(info.not_after > info.not_before);
        assert!(!info.serial.is_empty());
    }

    #[test]
    fn test_final_third() {
        let now = Utc::now();
        let info = LeafInfo {
            not_before: now - Duration::days(80),
            not_after: now + Duration::days(10),
            serial: "01".to_string(),
        };
        assert!(info.in_final_third(now));

        let fresh = LeafInfo {
            not_before: now - Duration::days(1),
            not_after: now + Duration::days(89),
            serial: "02".to_string(),
        };
        assert!(!fresh.in_final_third(now));
    }

    #[test]
    fn test_leaf_domains_from_subject_alternative_names() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let names = vec!["kms.example.com".to_string(), "Backup.Example.com".to_string()];
        let cert = rcgen::CertificateParams::new(names.clone())
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let bundle = CertificateBundle::new(names, cert.pem(), key_pair.serialize_pem(), Utc::now());

        let found: Vec<_> = bundle.leaf_domains().unwrap().into_iter().collect();
        assert_eq!(found, vec!["backup.example.com", "kms.example.com"]);

        let reordered = vec!["backup.example.com".to_string(), "KMS.example.com".to_string()];
        assert!(bundle.covers_exactly(&reordered).unwrap());
        assert!(!bundle.covers_exactly(&["kms.example.com".to_string()]).unwrap());
    }

    #[test]
    fn test_account_key_validation() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let account = AccountState::new(
            "ops@example.com",
            "{}".to_string(),
            URL_SAFE_NO_PAD.encode(key_pair.serialize_der()),
        );
        assert!(account.validate_key().is_ok());

        let broken = AccountState::new("ops@example.com", "{}".to_string(), "%%%".to_string());
        assert!(broken.validate_key().is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let bundle = self_signed("kms.example.com");
        let printed = format!("{bundle:?}");
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("PRIVATE KEY"));
    }
}
