use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use futures::Stream;
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::handlers::breaker::{BreakerConfig, BreakerRegistry};
use crate::metrics::IngestionMetrics;
use crate::models::*;

// Bound on cached (etag, payload) pairs kept for conditional requests
const MAX_ETAG_ENTRIES: usize = 50_000;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub host_max_in_flight: usize,
    pub max_pages: usize,
    pub breaker: BreakerConfig,
}

impl FetchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: cfg.http_timeout(),
            user_agent: cfg.http_user_agent.clone(),
            max_attempts: cfg.http_max_attempts.max(1),
            base_backoff_ms: cfg.http_retry_backoff_ms,
            max_backoff_ms: cfg.http_max_backoff_ms,
            host_max_in_flight: cfg.host_max_in_flight.max(1),
            max_pages: cfg.max_pages_per_collection.max(1),
            breaker: BreakerConfig {
                failure_threshold: cfg.breaker_failure_threshold,
                cooldown: Duration::from_millis(cfg.breaker_cooldown_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Fresh,
    NotModified,
}

/// Result of one conditional GET. `payload` is `None` on 304.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub payload: Option<Value>,
    pub etag: Option<String>,
    pub status: FetchStatus,
}

/// One page of a remote collection.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub number: usize,
    pub items: Vec<Value>,
    pub next: Option<Url>,
    pub status: FetchStatus,
}

#[derive(Debug, Clone)]
struct CachedResponse {
    etag: String,
    payload: Value,
}

struct PageCursor {
    next: Option<Url>,
    number: usize,
    seen: HashSet<String>,
    done: bool,
}

/// HTTP access to remote OParl servers: per-host concurrency limit, retry with
/// exponential backoff, per-host circuit breaker and ETag revalidation.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    settings: FetchSettings,
    breakers: BreakerRegistry,
    host_limits: Arc<DashMap<String, Arc<Semaphore>>>,
    etag_cache: Arc<DashMap<String, CachedResponse>>,
    metrics: Arc<IngestionMetrics>,
}

impl Fetcher {
    pub fn new(settings: FetchSettings, metrics: Arc<IngestionMetrics>) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout.min(Duration::from_secs(10)))
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            breakers: BreakerRegistry::new(settings.breaker),
            settings,
            host_limits: Arc::new(DashMap::new()),
            etag_cache: Arc::new(DashMap::new()),
            metrics,
        })
    }

    pub fn with_config(cfg: &Config, metrics: Arc<IngestionMetrics>) -> Result<Self> {
        Self::new(FetchSettings::from_config(cfg), metrics)
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Conditional GET of a JSON document.
    pub async fn fetch(&self, url: &Url, etag: Option<&str>) -> Result<FetchResponse> {
        self.with_retry(url, || self.get_json_once(url, etag)).await
    }

    /// GET a JSON document, revalidating against the ETag cache. A 304 answers with
    /// the cached payload.
    pub async fn fetch_json(&self, url: &Url) -> Result<(Value, FetchStatus)> {
        let key = url.to_string();
        let cached = self.etag_cache.get(&key).map(|c| c.value().clone());
        let response = self.fetch(url, cached.as_ref().map(|c| c.etag.as_str())).await?;
        match (response.status, response.payload, cached) {
            (FetchStatus::NotModified, _, Some(c)) => {
                IngestionMetrics::incr(&self.metrics.http_not_modified);
                Ok((c.payload, FetchStatus::NotModified))
            }
            (FetchStatus::NotModified, _, None) => Err(IngestionError::Sync(format!(
                "Received 304 without a cached representation for {}",
                url
            ))),
            (FetchStatus::Fresh, Some(payload), _) => {
                if let Some(etag) = response.etag {
                    if self.etag_cache.len() >= MAX_ETAG_ENTRIES {
                        self.etag_cache.clear();
                    }
                    self.etag_cache.insert(key, CachedResponse { etag, payload: payload.clone() });
                }
                Ok((payload, FetchStatus::Fresh))
            }
            (FetchStatus::Fresh, None, _) => Err(IngestionError::Malformed(format!("Empty body from {}", url))),
        }
    }

    /// Download raw bytes (file contents for text extraction).
    pub async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        self.with_retry(url, || async {
            let response = self.client.get(url.clone()).send().await?;
            let response = check_status(url, response).await?;
            Ok(response.bytes().await?.to_vec())
        })
        .await
    }

    /// Lazy sequence of collection pages following `next` links. The sequence ends after
    /// the last page or after the first error; it is not resumable mid-page.
    pub fn pages<'a>(
        &'a self,
        start: Url,
        modified_since: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Page>> + Send + 'a {
        let cursor = PageCursor {
            next: Some(with_modified_since(start, modified_since)),
            number: 0,
            seen: HashSet::new(),
            done: false,
        };
        futures::stream::unfold(cursor, move |mut st| {
            let cancel = cancel.clone();
            async move {
                if st.done {
                    return None;
                }
                let url = st.next.take()?;
                if st.number >= self.settings.max_pages {
                    tracing::warn!(url = %url, max_pages = self.settings.max_pages, "Page limit reached; stopping pagination");
                    return None;
                }
                if !st.seen.insert(url.to_string()) {
                    tracing::warn!(url = %url, "Pagination loop detected; stopping");
                    return None;
                }
                let res = tokio::select! {
                    _ = cancel.cancelled() => Err(IngestionError::Cancelled),
                    r = self.fetch_json(&url) => r,
                };
                match res {
                    Ok((payload, status)) => {
                        let items = extract_records(&payload);
                        let next = next_link(&payload, &url);
                        st.number += 1;
                        st.next = next.clone();
                        tracing::debug!(url = %url, page = st.number, record_count = items.len(), has_next = next.is_some(), "Fetched collection page");
                        Some((Ok(Page { url, number: st.number, items, next, status }), st))
                    }
                    Err(e) => {
                        st.done = true;
                        Some((Err(e), st))
                    }
                }
            }
        })
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.host_limits
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.settings.host_max_in_flight)))
            .clone()
    }

    fn backoff_for(&self, attempt: u32, err: &IngestionError) -> Duration {
        let exp = self.settings.base_backoff_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let mut ms = exp.min(self.settings.max_backoff_ms);
        if let IngestionError::RateLimited { retry_after_ms: Some(after), .. } = err {
            ms = ms.max(*after).min(self.settings.max_backoff_ms);
        }
        Duration::from_millis(ms)
    }

    async fn with_retry<T, F, Fut>(&self, url: &Url, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let host = host_key(url);
        let breaker = self.breakers.for_host(&host);
        let limiter = self.host_semaphore(&host);
        let mut attempt: u32 = 0;
        loop {
            let admission = match breaker.try_acquire() {
                Some(a) => a,
                None => {
                    IngestionMetrics::incr(&self.metrics.breaker_short_circuits);
                    tracing::debug!(host = %host, url = %url, "Circuit open; short-circuiting request");
                    return Err(IngestionError::HostUnavailable { host });
                }
            };
            let permit = match limiter.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    drop(admission);
                    return Err(IngestionError::Sync(format!("Request limiter for {} closed", host)));
                }
            };
            IngestionMetrics::incr(&self.metrics.http_requests);
            let started = Instant::now();
            let result = op().await;
            drop(permit);
            self.metrics.record_request_latency(started.elapsed().as_millis() as u64);

            match result {
                Ok(v) => {
                    admission.succeed();
                    return Ok(v);
                }
                Err(e) if e.is_transient() => {
                    if admission.fail() {
                        IngestionMetrics::incr(&self.metrics.breaker_opened);
                        tracing::warn!(host = %host, cooldown_ms = self.settings.breaker.cooldown.as_millis() as u64, "Circuit breaker opened");
                    }
                    attempt += 1;
                    if attempt >= self.settings.max_attempts {
                        IngestionMetrics::incr(&self.metrics.http_failures);
                        tracing::warn!(url = %url, attempts = attempt, error = %e, "Giving up after retries");
                        return Err(e);
                    }
                    let backoff = self.backoff_for(attempt, &e);
                    IngestionMetrics::incr(&self.metrics.http_retries);
                    tracing::warn!(url = %url, attempt = attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "Transient error; retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    // Host answered; only transport-level trouble counts against the breaker
                    admission.succeed();
                    IngestionMetrics::incr(&self.metrics.http_failures);
                    return Err(e);
                }
            }
        }
    }

    async fn get_json_once(&self, url: &Url, etag: Option<&str>) -> Result<FetchResponse> {
        let mut rb = self.client.get(url.clone()).header(ACCEPT, "application/json");
        if let Some(tag) = etag {
            rb = rb.header(IF_NONE_MATCH, tag);
        }
        let response = rb.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse { payload: None, etag: etag.map(str::to_string), status: FetchStatus::NotModified });
        }
        let response = check_status(url, response).await?;
        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;
        let payload: Value = serde_json::from_str(&text)
            .map_err(|e| IngestionError::Malformed(format!("Invalid JSON from {}: {}", url, e)))?;
        Ok(FetchResponse { payload: Some(payload), etag: new_etag, status: FetchStatus::Fresh })
    }
}

/// Map a non-success response onto the error taxonomy.
async fn check_status(url: &Url, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000));
        return Err(IngestionError::RateLimited { host: host_key(url), retry_after_ms });
    }
    let body = response.text().await.unwrap_or_default();
    let preview: String = body.chars().take(200).collect();
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Err(IngestionError::Transient { url: url.to_string(), detail: format!("status={} body={}", status, preview) });
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(IngestionError::NotFound(url.to_string()));
    }
    Err(IngestionError::Status { url: url.to_string(), status: status.as_u16() })
}

pub fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{}:{}", h, p),
        (Some(h), None) => h.to_string(),
        _ => url.as_str().to_string(),
    }
}

pub fn with_modified_since(mut url: Url, since: Option<DateTime<Utc>>) -> Url {
    if let Some(ts) = since {
        let present = url.query_pairs().any(|(k, _)| k == "modified_since");
        if !present {
            url.query_pairs_mut()
                .append_pair("modified_since", &ts.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }
    url
}

/// Records of a collection page. Besides the OParl `data` member, common envelope
/// shapes are accepted.
pub fn extract_records(data: &Value) -> Vec<Value> {
    let records = if let Some(items) = data.get("data").and_then(|v| v.as_array()) {
        items.clone()
    } else if let Some(items) = data.get("items").and_then(|v| v.as_array()) {
        items.clone()
    } else if let Some(results) = data.get("results").and_then(|v| v.as_array()) {
        results.clone()
    } else if let Some(arr) = data.as_array() {
        arr.clone()
    } else if data.get("id").is_some() {
        vec![data.clone()]
    } else {
        Vec::new()
    };
    records
}

/// `links.next` (OParl 1.x) or a top-level `next`, resolved against the page URL.
pub fn next_link(data: &Value, base: &Url) -> Option<Url> {
    let raw = data
        .get("links")
        .and_then(|l| l.get("next"))
        .or_else(|| data.get("next"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    base.join(raw).ok()
}
