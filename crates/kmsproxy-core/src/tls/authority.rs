// Certificate authority client interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AuthorityError;

use super::bundle::AccountState;

/// Result of a successful account registration
#[derive(Clone)]
pub struct Registration {
    /// Opaque account reference, stored as-is
    pub handle: String,

    /// Account key, PKCS#8 DER encoded as base64url without padding
    pub private_key: String,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A freshly signed certificate and the key it was requested with, both PEM
#[derive(Clone)]
pub struct IssuedCertificate {
    pub certificate_chain: String,
    pub private_key: String,
}

/// Authority-suggested time range for renewing the current certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The protocol side of certificate management
///
/// Implementations do not retry on their own; callers bound every call with a deadline.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Create a new account, generating its key
    async fn register(&self, email: &str) -> Result<Registration, AuthorityError>;

    /// Rebuild the authority session from persisted account state
    async fn resume(&self, account: &AccountState) -> Result<(), AuthorityError>;

    /// Validate control of `domains` and obtain a certificate covering all of them
    async fn obtain_certificate(
        &self,
        account: &AccountState,
        domains: &[String],
    ) -> Result<IssuedCertificate, AuthorityError>;

    /// Ask when the certificate with the given DER leaf should be renewed
    async fn suggested_renewal(
        &self,
        account: &AccountState,
        leaf: &[u8],
    ) -> Result<RenewalWindow, AuthorityError>;
}
