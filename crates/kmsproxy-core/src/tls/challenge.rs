// DNS-01 challenge records and the webhook API that manages them

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::{config::ChallengeConfig, error::ChallengeError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A published TXT record, kept for cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecord {
    pub record_id: String,
    pub name: String,
}

/// Publishes and removes the DNS records the authority validates against
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    async fn create_txt_record(&self, name: &str, content: &str) -> Result<TxtRecord, ChallengeError>;

    async fn delete_txt_record(&self, record: &TxtRecord) -> Result<(), ChallengeError>;

    /// Time for a new record to become visible to the authority's resolvers
    fn propagation_delay(&self) -> Duration;
}

/// Records published for one order
///
/// Whatever is still held when this is dropped, for instance because the
/// order future was abandoned on a deadline, is deleted from a spawned task.
pub struct PublishedRecords {
    provider: Arc<dyn ChallengeProvider>,
    records: Vec<TxtRecord>,
}

impl PublishedRecords {
    pub fn new(provider: Arc<dyn ChallengeProvider>) -> Self {
        Self {
            provider,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TxtRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Delete every held record, failures are only logged
    pub async fn remove_all(&mut self) {
        while let Some(record) = self.records.last() {
            delete_record(self.provider.as_ref(), record).await;
            self.records.pop();
        }
    }
}

impl Drop for PublishedRecords {
    fn drop(&mut self) {
        if self.records.is_empty() {
            return;
        }

        let records = std::mem::take(&mut self.records);
        let provider = Arc::clone(&self.provider);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Removing {} abandoned challenge record(s)", records.len());
                handle.spawn(async move {
                    for record in &records {
                        delete_record(provider.as_ref(), record).await;
                    }
                });
            }
            Err(_) => {
                for record in &records {
                    warn!("Challenge record {} was left behind", record.name);
                }
            }
        }
    }
}

async fn delete_record(provider: &dyn ChallengeProvider, record: &TxtRecord) {
    if let Err(e) = provider.delete_txt_record(record).await {
        warn!("Failed to clean up challenge record {}: {e}", record.name);
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

/// Record management delegated to an HTTP API
///
/// `POST <create_url>` with `{"type": "TXT", "name", "content"}` answers `{"id"}`.
/// `DELETE <delete_url>` has `{record_id}` substituted, and a 404 counts as deleted.
pub struct WebhookChallengeProvider {
    client: reqwest::Client,
    create_url: String,
    delete_url: String,
    headers: HeaderMap,
    propagation_delay: Duration,
}

impl WebhookChallengeProvider {
    pub fn new(
        create_url: String,
        delete_url: String,
        headers: &HashMap<String, String>,
        propagation_delay: Duration,
    ) -> Result<Self, ChallengeError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            create_url,
            delete_url,
            headers: build_headers(headers)?,
            propagation_delay,
        })
    }

    pub fn from_config(config: &ChallengeConfig) -> Result<Self, ChallengeError> {
        let create_url = config
            .create_url
            .clone()
            .ok_or_else(|| ChallengeError::Parse("challenge.create_url is not set".to_string()))?;
        let delete_url = config
            .delete_url
            .clone()
            .ok_or_else(|| ChallengeError::Parse("challenge.delete_url is not set".to_string()))?;

        Self::new(create_url, delete_url, &config.headers, config.propagation_delay())
    }

    fn delete_url_for(&self, record: &TxtRecord) -> String {
        self.delete_url.replace("{record_id}", &record.record_id)
    }
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, ChallengeError> {
    let mut header_map = HeaderMap::new();
    header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ChallengeError::Parse(format!("Invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ChallengeError::Parse(format!("Invalid value for header `{name}`: {e}")))?;
        header_map.insert(name, value);
    }

    Ok(header_map)
}

#[async_trait]
impl ChallengeProvider for WebhookChallengeProvider {
    async fn create_txt_record(&self, name: &str, content: &str) -> Result<TxtRecord, ChallengeError> {
        debug!("Creating TXT record {name}");

        let response = self
            .client
            .post(&self.create_url)
            .headers(self.headers.clone())
            .json(&CreateRequest {
                record_type: "TXT",
                name,
                content,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChallengeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: CreateResponse = response
            .json()
            .await
            .map_err(|e| ChallengeError::Parse(e.to_string()))?;

        Ok(TxtRecord {
            record_id: body.id,
            name: name.to_string(),
        })
    }

    async fn delete_txt_record(&self, record: &TxtRecord) -> Result<(), ChallengeError> {
        debug!("Deleting TXT record {} ({})", record.name, record.record_id);

        let response = self
            .client
            .delete(self.delete_url_for(record))
            .headers(self.headers.clone())
            .send()
            .await?;

        let status = response.status();
        // Already gone
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChallengeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    fn propagation_delay(&self) -> Duration {
        self.propagation_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        created: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl ChallengeProvider for CountingProvider {
        async fn create_txt_record(&self, name: &str, _content: &str) -> Result<TxtRecord, ChallengeError> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TxtRecord {
                record_id: id.to_string(),
                name: name.to_string(),
            })
        }

        async fn delete_txt_record(&self, _record: &TxtRecord) -> Result<(), ChallengeError> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn propagation_delay(&self) -> Duration {
            Duration::ZERO
        }
    }

    async fn publish(provider: &Arc<CountingProvider>, count: usize) -> PublishedRecords {
        let mut records = PublishedRecords::new(provider.clone());
        for i in 0..count {
            let name = format!("_acme-challenge.d{i}.example.com");
            records.push(provider.create_txt_record(&name, "digest").await.unwrap());
        }
        records
    }

    #[tokio::test]
    async fn test_remove_all_deletes_each_record_once() {
        let provider = Arc::new(CountingProvider::default());
        let mut records = publish(&provider, 2).await;

        records.remove_all().await;
        assert!(records.is_empty());
        drop(records);
        tokio::task::yield_now().await;

        assert_eq!(provider.deleted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_order_still_deletes_records() {
        let provider = Arc::new(CountingProvider::default());

        let order = {
            let provider = provider.clone();
            async move {
                let _records = publish(&provider, 3).await;
                std::future::pending::<()>().await;
            }
        };
        assert!(tokio::time::timeout(Duration::from_millis(10), order).await.is_err());
        assert_eq!(provider.created.load(Ordering::SeqCst), 3);

        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.deleted.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("abandoned records were not deleted");
    }

    fn provider() -> WebhookChallengeProvider {
        let headers = HashMap::from([("Authorization".to_string(), "Bearer token".to_string())]);
        WebhookChallengeProvider::new(
            "https://dns.example.com/records".to_string(),
            "https://dns.example.com/records/{record_id}".to_string(),
            &headers,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_delete_url_substitution() {
        let record = TxtRecord {
            record_id: "abc123".to_string(),
            name: "_acme-challenge.kms.example.com".to_string(),
        };
        assert_eq!(provider().delete_url_for(&record), "https://dns.example.com/records/abc123");
    }

    #[test]
    fn test_headers_include_content_type() {
        let provider = provider();
        assert_eq!(provider.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(provider.headers.get("authorization").unwrap(), "Bearer token");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        assert!(build_headers(&headers).is_err());
    }

    #[test]
    fn test_propagation_delay() {
        assert_eq!(provider().propagation_delay(), Duration::from_secs(5));
    }
}
