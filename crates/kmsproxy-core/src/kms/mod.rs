// Remote key management used by seal and unseal

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{config::KmsConfig, error::KmsError};

/// Encrypt/decrypt oracle keyed by a configured key identifier
///
/// `node` is passed along for the remote audit log only.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    async fn encrypt(&self, node: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    async fn decrypt(&self, node: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Confirm the configured key exists and is usable
    async fn check_key(&self) -> Result<(), KmsError>;
}

#[derive(Serialize)]
struct CryptRequest<'a> {
    key_id: &'a str,
    node: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct CryptResponse {
    data: String,
}

#[derive(Serialize)]
struct DescribeRequest<'a> {
    key_id: &'a str,
}

/// JSON-over-HTTP key management client
///
/// `POST <endpoint>/encrypt` and `/decrypt` take `{"key_id", "node", "data"}`
/// with base64 data and answer `{"data"}`. `POST <endpoint>/describe` checks the key.
pub struct HttpKeyManagement {
    client: reqwest::Client,
    endpoint: String,
    key_id: String,
}

impl HttpKeyManagement {
    pub fn new(endpoint: impl Into<String>, key_id: impl Into<String>, timeout: Duration) -> Result<Self, KmsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
        })
    }

    pub fn from_config(config: &KmsConfig) -> Result<Self, KmsError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| KmsError::Decode("kms.endpoint is not set".to_string()))?;

        Self::new(endpoint, config.key_id.clone(), config.timeout())
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/{operation}", self.endpoint)
    }

    async fn transform(&self, operation: &str, node: &str, data: &[u8]) -> Result<Vec<u8>, KmsError> {
        debug!("Key management {operation} for node {node}");

        let response = self
            .client
            .post(self.url(operation))
            .json(&CryptRequest {
                key_id: &self.key_id,
                node,
                data: STANDARD.encode(data),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(KmsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: CryptResponse = response
            .json()
            .await
            .map_err(|e| KmsError::Decode(e.to_string()))?;

        STANDARD
            .decode(body.data)
            .map_err(|e| KmsError::Decode(format!("Response data is not base64: {e}")))
    }
}

#[async_trait]
impl KeyManagement for HttpKeyManagement {
    async fn encrypt(&self, node: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.transform("encrypt", node, plaintext).await
    }

    async fn decrypt(&self, node: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.transform("decrypt", node, ciphertext).await
    }

    async fn check_key(&self) -> Result<(), KmsError> {
        let response = self
            .client
            .post(self.url("describe"))
            .json(&DescribeRequest { key_id: &self.key_id })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(KmsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}
