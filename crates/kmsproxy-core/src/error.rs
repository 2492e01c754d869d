use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error in `{field}`: {message}")]
    Invalid { field: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Failures reading or writing the working directory
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No persisted state found")]
    NotFound,

    #[error("Persisted state at `{path}` is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Failed to parse certificate chain: {0}")]
    InvalidCertificate(String),

    #[error("Failed to parse private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Certificate chain is empty")]
    EmptyChain,
}

#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Challenge API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse challenge API response: {0}")]
    Parse(String),
}

/// Errors surfaced by a certificate authority client
#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Account error: {0}")]
    Account(String),

    #[error("No account session, the account must be registered or resumed first")]
    NotRegistered,

    #[error("Order error: {0}")]
    Order(String),

    #[error("Challenge failed: {0}")]
    Challenge(String),

    #[error("Challenge provider error: {0}")]
    ChallengeProvider(#[from] ChallengeError),

    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    #[error("Suggested renewal windows are not supported by this authority")]
    RenewalInfoUnsupported,

    #[error("Authority call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Certificate receiver is gone")]
    ReaderGone,

    #[error("No receiver accepted the certificate within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Account bootstrap failed: {0}")]
    Bootstrap(#[source] AuthorityError),

    #[error("Failed to restore account session: {0}")]
    Restore(#[source] AuthorityError),

    #[error("Certificate renewal failed: {0}")]
    Renewal(#[source] AuthorityError),

    #[error("Persisted account key is unusable: {0}")]
    AccountKey(String),

    #[error("Issued certificate is unusable: {0}")]
    Bundle(#[from] BundleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Certificate hand-off failed: {0}")]
    Handoff(#[from] HandoffError),
}

impl AgentError {
    /// Whether the process cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AgentError::Restore(_) | AgentError::Renewal(_))
    }
}

#[derive(Error, Debug)]
pub enum DistributorError {
    #[error("No certificate is available yet")]
    NotReady,

    #[error("Active certificate is unusable: {0}")]
    Bundle(#[from] BundleError),
}

#[derive(Error, Debug)]
pub enum KmsError {
    #[error("Key management request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Key management service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed key management response: {0}")]
    Decode(String),
}

impl From<KmsError> for tonic::Status {
    fn from(err: KmsError) -> Self {
        tonic::Status::internal(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to `{address}`: {source}")]
    FailedToBind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    FailedToAcceptConnection(std::io::Error),

    #[error("Key management startup check failed: {0}")]
    KeyCheck(#[from] KmsError),

    #[error("RPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Failed to load the persisted certificate: {0}")]
    Store(#[from] StoreError),
}

/// Error returned by a supervised unit
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Fatal errors stop the whole process instead of restarting the unit
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Agent(e) => e.is_fatal(),
            Error::Server(ServerError::FailedToBind { .. }) => true,
            Error::Server(ServerError::Store(StoreError::Corrupt { .. })) => true,
            Error::Server(_) => false,
            Error::Config(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let bind = Error::Server(ServerError::FailedToBind {
            address: "0.0.0.0:4050".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        });
        assert!(bind.is_fatal());

        let corrupt = Error::Agent(AgentError::Store(StoreError::Corrupt {
            path: "certs/key.pem".to_string(),
            message: "Private key is missing".to_string(),
        }));
        assert!(corrupt.is_fatal());

        let renewal = Error::Agent(AgentError::Renewal(AuthorityError::Timeout(Duration::from_secs(1))));
        assert!(!renewal.is_fatal());

        let key_check = Error::Server(ServerError::KeyCheck(KmsError::Decode("bad".to_string())));
        assert!(!key_check.is_fatal());
    }
}
