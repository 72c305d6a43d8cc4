use super::api::{BackendApi, SubmissionOutcome};
use crate::domain::{HandlerKey, Item};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

/// Payloads with more items than this are gzip-compressed.
const COMPRESSION_THRESHOLD: usize = 100;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Payload compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub user_agent: String,
    pub enable_compression: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:2878/".to_string(),
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_connections: 20,
            keep_alive_timeout: Duration::from_secs(60),
            user_agent: concat!("telemetry-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
            enable_compression: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: Duration,
}

#[derive(Debug, Default)]
pub struct ClientStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time: AtomicU64,
}

impl ClientStats {
    pub fn record_request(&self, success: bool, response_time: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);

        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    #[serde(default)]
    rejected: Option<Vec<usize>>,
    #[serde(default)]
    message: String,
}

/// Backend API over HTTP: one POST of newline-separated items per batch to
/// `{endpoint}/report/{entity}?handle={handle}`.
#[derive(Debug, Clone)]
pub struct HttpBackendApi {
    client: Client,
    config: ClientConfig,
    base_url: Url,
    stats: Arc<ClientStats>,
}

impl HttpBackendApi {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut base_url: Url = config.endpoint.parse().map_err(|e| {
            ClientError::InvalidConfiguration(format!("Invalid endpoint URL: {}", e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidConfiguration(format!(
                "Endpoint URL cannot be a base: {}",
                config.endpoint
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| {
                ClientError::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            config,
            base_url,
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn report_url(&self, key: &HandlerKey) -> Result<Url, ClientError> {
        let mut url = self
            .base_url
            .join(&format!("report/{}", key.entity_type()))
            .map_err(|e| ClientError::InvalidConfiguration(format!("Invalid report URL: {}", e)))?;
        url.query_pairs_mut().append_pair("handle", key.handle());
        Ok(url)
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let total_requests = self.stats.total_requests.load(Ordering::Relaxed);
        let total_response_time = self.stats.total_response_time.load(Ordering::Relaxed);

        let average_response_time = if total_requests > 0 {
            Duration::from_millis(total_response_time / total_requests)
        } else {
            Duration::ZERO
        };

        ConnectionStats {
            total_requests,
            successful_requests: self.stats.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            average_response_time,
        }
    }

    fn prepare_payload(&self, items: &[Item]) -> Result<(Vec<u8>, bool), ClientError> {
        let mut body = Vec::with_capacity(items.iter().map(|i| i.len() + 1).sum());
        for item in items {
            body.extend_from_slice(item.as_bytes());
            body.push(b'\n');
        }

        if self.config.enable_compression && items.len() > COMPRESSION_THRESHOLD {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            Ok((encoder.finish()?, true))
        } else {
            Ok((body, false))
        }
    }

    async fn try_submit(
        &self,
        key: &HandlerKey,
        items: &[Item],
    ) -> Result<SubmissionOutcome, ClientError> {
        let url = self.report_url(key)?;
        let (payload, compressed) = self.prepare_payload(items)?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
            .body(payload);
        if compressed {
            request = request.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        self.stats.record_request(status.is_success(), start.elapsed());

        if status.is_success() {
            return Ok(SubmissionOutcome::Delivered);
        }

        let outcome = match status {
            StatusCode::BAD_REQUEST => {
                let text = response.text().await.unwrap_or_default();
                Self::parse_rejection(&text)
            }
            StatusCode::NOT_ACCEPTABLE | StatusCode::TOO_MANY_REQUESTS => {
                SubmissionOutcome::RateLimited
            }
            other => SubmissionOutcome::Unavailable(format!("HTTP {}", other.as_u16())),
        };
        Ok(outcome)
    }

    /// Indices are passed through as listed; an absent or empty list refuses
    /// the whole payload.
    fn parse_rejection(body: &str) -> SubmissionOutcome {
        match serde_json::from_str::<RejectionBody>(body) {
            Ok(parsed) => SubmissionOutcome::Rejected {
                indices: parsed.rejected.filter(|indices| !indices.is_empty()),
                message: parsed.message,
            },
            Err(_) => SubmissionOutcome::Rejected {
                indices: None,
                message: body.trim().to_string(),
            },
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackendApi {
    async fn submit(&self, key: &HandlerKey, items: &[Item]) -> SubmissionOutcome {
        match self.try_submit(key, items).await {
            Ok(outcome) => outcome,
            Err(ClientError::NetworkError(e)) => {
                self.stats.record_request(false, Duration::ZERO);
                let reason = if e.is_timeout() {
                    format!("timeout: {}", e)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    e.to_string()
                };
                tracing::debug!(pipeline = %key, error = %reason, "Backend submission failed");
                SubmissionOutcome::Unavailable(reason)
            }
            Err(e) => SubmissionOutcome::Unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;

    #[test]
    fn test_report_url_keeps_endpoint_path() {
        let api = HttpBackendApi::new(ClientConfig {
            endpoint: "http://backend.local:8080/api".to_string(),
            ..Default::default()
        })
        .unwrap();
        let key = HandlerKey::new(EntityType::Histograms, "40000");

        assert_eq!(
            api.report_url(&key).unwrap().as_str(),
            "http://backend.local:8080/api/report/histograms?handle=40000"
        );
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let result = HttpBackendApi::new(ClientConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(ClientError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_parse_rejection_keeps_listed_indices() {
        let outcome = HttpBackendApi::parse_rejection(r#"{"rejected":[1,7,99],"message":"bad"}"#);
        assert_eq!(
            outcome,
            SubmissionOutcome::Rejected {
                indices: Some(vec![1, 7, 99]),
                message: "bad".to_string()
            }
        );

        let outcome = HttpBackendApi::parse_rejection(r#"{"rejected":[],"message":"bad"}"#);
        assert_eq!(
            outcome,
            SubmissionOutcome::Rejected {
                indices: None,
                message: "bad".to_string()
            }
        );

        let outcome = HttpBackendApi::parse_rejection("malformed payload");
        assert_eq!(
            outcome,
            SubmissionOutcome::Rejected {
                indices: None,
                message: "malformed payload".to_string()
            }
        );
    }
}
