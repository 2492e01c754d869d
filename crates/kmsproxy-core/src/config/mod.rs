#[cfg(feature = "toml")]
pub mod toml;

mod log_level;

pub use log_level::LogLevel;

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    tls::acme::{LETS_ENCRYPT_PRODUCTION_URL, LETS_ENCRYPT_STAGING_URL},
};

/// DNS-01 challenge webhook settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChallengeConfig {
    /// Endpoint that creates a TXT record
    #[serde(default)]
    pub create_url: Option<String>,

    /// Endpoint that deletes a TXT record, `{record_id}` is substituted
    #[serde(default)]
    pub delete_url: Option<String>,

    /// Extra headers sent with every webhook request (e.g. authorization)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Seconds to wait for a new record to propagate (default: 30)
    #[serde(default = "ChallengeConfig::default_propagation_secs")]
    pub propagation_secs: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            create_url: None,
            delete_url: None,
            headers: HashMap::new(),
            propagation_secs: Self::default_propagation_secs(),
        }
    }
}

impl ChallengeConfig {
    pub fn default_propagation_secs() -> u64 {
        30
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_secs(self.propagation_secs)
    }
}

/// Remote key management service settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KmsConfig {
    /// Base URL of the key management service
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Identifier of the key used for every seal/unseal call
    #[serde(default)]
    pub key_id: String,

    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "KmsConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key_id: String::new(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

impl KmsConfig {
    pub fn default_timeout_secs() -> u64 {
        10
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Deadlines applied around external interactions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeouts {
    /// Bound on a single certificate authority call (default: 300)
    #[serde(default = "Timeouts::default_authority_secs")]
    pub authority_secs: u64,

    /// How long a new certificate waits for the listener to pick it up (default: 120)
    #[serde(default = "Timeouts::default_handoff_secs")]
    pub handoff_secs: u64,

    /// TLS handshake deadline per connection (default: 10)
    #[serde(default = "Timeouts::default_handshake_secs")]
    pub handshake_secs: u64,

    /// Drain window for in-flight requests on shutdown (default: 10)
    #[serde(default = "Timeouts::default_drain_secs")]
    pub drain_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            authority_secs: Self::default_authority_secs(),
            handoff_secs: Self::default_handoff_secs(),
            handshake_secs: Self::default_handshake_secs(),
            drain_secs: Self::default_drain_secs(),
        }
    }
}

impl Timeouts {
    pub fn default_authority_secs() -> u64 {
        300
    }

    pub fn default_handoff_secs() -> u64 {
        120
    }

    pub fn default_handshake_secs() -> u64 {
        10
    }

    pub fn default_drain_secs() -> u64 {
        10
    }

    pub fn authority(&self) -> Duration {
        Duration::from_secs(self.authority_secs)
    }

    pub fn handoff(&self) -> Duration {
        Duration::from_secs(self.handoff_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

/// The core configuration options available
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Domains the certificate covers, the first one is the primary domain
    #[serde(default)]
    pub domains: Vec<String>,

    /// Contact address for the ACME account
    #[serde(default)]
    pub email: String,

    /// Use the Let's Encrypt staging environment (default: false)
    #[serde(default)]
    pub staging: bool,

    /// Explicit ACME directory, overrides `staging`
    #[serde(default)]
    pub directory_url: Option<String>,

    /// Directory holding the account and certificate state (default: ".kmsproxy")
    #[serde(default = "Config::default_workdir")]
    pub workdir: PathBuf,

    /// Address the RPC listener binds to (default: 0.0.0.0:4050)
    #[serde(default = "Config::default_listen")]
    pub listen: SocketAddr,

    /// The log level to use (default: "info")
    #[serde(default)]
    pub log_level: Option<LogLevel>,

    #[serde(default)]
    pub challenge: ChallengeConfig,

    #[serde(default)]
    pub kms: KmsConfig,

    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            domains: Vec::new(),
            email: String::new(),
            staging: false,
            directory_url: None,
            workdir: Config::default_workdir(),
            listen: Config::default_listen(),
            log_level: Some(LogLevel::default()),
            challenge: ChallengeConfig::default(),
            kms: KmsConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    pub fn default_workdir() -> PathBuf {
        PathBuf::from(".kmsproxy")
    }

    pub fn default_listen() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 4050)
    }

    /// The first configured domain, used for file names
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    /// The ACME directory to talk to
    pub fn directory(&self) -> String {
        match &self.directory_url {
            Some(url) => url.clone(),
            None if self.staging => LETS_ENCRYPT_STAGING_URL.to_string(),
            None => LETS_ENCRYPT_PRODUCTION_URL.to_string(),
        }
    }

    /// Checks the configuration for values the proxy cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.is_empty() {
            return Err(invalid("domains", "At least one domain is required"));
        }

        for domain in &self.domains {
            validate_domain(domain)?;
        }

        if let Some(url) = &self.directory_url {
            validate_url("directory_url", url)?;
        }

        match &self.challenge.create_url {
            Some(url) => validate_url("challenge.create_url", url)?,
            None => return Err(invalid("challenge.create_url", "A record creation endpoint is required")),
        }

        match &self.challenge.delete_url {
            Some(url) => validate_url("challenge.delete_url", &url.replace("{record_id}", "id"))?,
            None => return Err(invalid("challenge.delete_url", "A record deletion endpoint is required")),
        }

        match &self.kms.endpoint {
            Some(url) => validate_url("kms.endpoint", url)?,
            None => return Err(invalid("kms.endpoint", "A key management endpoint is required")),
        }

        if self.kms.key_id.trim().is_empty() {
            return Err(invalid("kms.key_id", "A key identifier is required"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// The primary domain doubles as a file name, so path characters are rejected
fn validate_domain(domain: &str) -> Result<(), ConfigError> {
    if domain.trim().is_empty() {
        return Err(invalid("domains", "Domain names cannot be empty"));
    }

    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(ConfigError::Invalid {
            field: "domains".to_string(),
            message: format!("Invalid domain `{domain}`: contains path traversal characters"),
        });
    }

    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value).map_err(|e| ConfigError::Invalid {
        field: field.to_string(),
        message: format!("Invalid URL `{value}`: {e}"),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            domains: vec!["kms.example.com".to_string()],
            challenge: ChallengeConfig {
                create_url: Some("https://dns.example.com/records".to_string()),
                delete_url: Some("https://dns.example.com/records/{record_id}".to_string()),
                ..Default::default()
            },
            kms: KmsConfig {
                endpoint: Some("https://keys.example.com".to_string()),
                key_id: "alias/talos".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_empty_domains_rejected() {
        let config = Config {
            domains: Vec::new(),
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "domains"
        ));
    }

    #[test]
    fn test_path_like_domain_rejected() {
        let config = Config {
            domains: vec!["../etc".to_string()],
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_key_id_rejected() {
        let mut config = valid_config();
        config.kms.key_id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_directory_selection() {
        let mut config = valid_config();
        assert_eq!(config.directory(), LETS_ENCRYPT_PRODUCTION_URL);

        config.staging = true;
        assert_eq!(config.directory(), LETS_ENCRYPT_STAGING_URL);

        config.directory_url = Some("https://localhost:14000/dir".to_string());
        assert_eq!(config.directory(), "https://localhost:14000/dir");
    }

    #[test]
    fn test_primary_domain_is_first() {
        let mut config = valid_config();
        config.domains.push("alt.example.com".to_string());
        assert_eq!(config.primary_domain(), Some("kms.example.com"));
    }
}
