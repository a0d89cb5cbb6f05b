use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::handlers::host_key;
use crate::models::*;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Deserialize)]
pub struct OcrResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Client for the external OCR capability: `POST <endpoint>` with the raw file bytes,
/// answered by `{"text": ..., "confidence": ...}`.
#[derive(Clone)]
pub struct CloudOcrClient {
    http: Client,
    endpoint: Url,
    api_key: Option<String>,
    limiter: Option<Arc<DirectLimiter>>,
}

impl CloudOcrClient {
    pub fn new(endpoint: &str, api_key: Option<String>, requests_per_minute: u32, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| IngestionError::Configuration(format!("Invalid OCR endpoint {}: {}", endpoint, e)))?;
        let http = Client::builder().timeout(timeout).build()?;
        let limiter = NonZeroU32::new(requests_per_minute).map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));
        Ok(Self { http, endpoint, api_key, limiter })
    }

    pub async fn extract(&self, bytes: &[u8], mime_type: Option<&str>) -> Result<OcrResponse> {
        let host = host_key(&self.endpoint);
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                return Err(IngestionError::RateLimited { host, retry_after_ms: None });
            }
        }

        let mut rb = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, mime_type.unwrap_or("application/octet-stream"))
            .body(bytes.to_vec());
        if let Some(key) = &self.api_key {
            rb = rb.header(AUTHORIZATION, format!("Bearer {}", key));
        }
        let response = rb.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000));
            return Err(IngestionError::RateLimited { host, retry_after_ms });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(IngestionError::Extraction(format!("OCR service returned {}: {}", status, preview)));
        }
        response
            .json::<OcrResponse>()
            .await
            .map_err(|e| IngestionError::Extraction(format!("Invalid OCR response: {}", e)))
    }
}
