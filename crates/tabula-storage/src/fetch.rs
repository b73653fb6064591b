use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub const JSON_ACCEPT: &str = "application/json;odata=nometadata";
pub const XML_ACCEPT: &str = "application/xml, text/xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `unit * base^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub unit: Duration,
    pub base: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unit: Duration::from_secs(1),
            base: 4,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = self
            .base
            .checked_pow(attempt_index as u32)
            .unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor).min(self.max_delay)
    }
}

/// Enforces a minimum gap between requests to the same host.
///
/// Callers reserve the next free slot under the lock and sleep outside it, so
/// concurrent requests to one host queue up at `min_interval` spacing.
#[derive(Debug)]
pub struct HostPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

static GLOBAL_PACER: OnceLock<Arc<HostPacer>> = OnceLock::new();

impl HostPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide pacer; the first caller fixes the interval.
    pub fn global(min_interval: Duration) -> Arc<HostPacer> {
        GLOBAL_PACER
            .get_or_init(|| Arc::new(HostPacer::new(min_interval)))
            .clone()
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait_turn(&self, host: &str) {
        let wait = {
            let mut slots = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let slot = slots
                .get(host)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(host.to_string(), slot + self.min_interval);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!(host, ?wait, "pacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub min_host_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            min_host_interval: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected content type `{content_type}` for {url}: {preview}")]
    UnexpectedContentType {
        url: String,
        content_type: String,
        preview: String,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch client is shut down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Arc<HostPacer>,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    /// Builds a fetcher that shares the process-wide host pacer.
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let pacer = HostPacer::global(config.min_host_interval);
        Self::with_pacer(config, pacer)
    }

    pub fn with_pacer(config: HttpClientConfig, pacer: Arc<HostPacer>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            pacer,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET a JSON document, insisting on a JSON-ish content type.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.get(url, Some(JSON_ACCEPT)).await?;
        let content_type = response.content_type.clone().unwrap_or_default();
        let lowered = content_type.to_ascii_lowercase();
        if !lowered.contains("json") && !lowered.contains("odata") {
            let preview: String = String::from_utf8_lossy(&response.body)
                .chars()
                .take(200)
                .collect();
            return Err(FetchError::UnexpectedContentType {
                url: url.to_string(),
                content_type,
                preview,
            });
        }

        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    pub async fn fetch_xml(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url, Some(XML_ACCEPT)).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    pub async fn fetch_binary(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(url, None).await
    }

    async fn get(&self, url: &str, accept: Option<&str>) -> Result<FetchedResponse, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        self.get_with_retries(url, &host, accept)
            .instrument(info_span!("http_fetch", url, host = %host))
            .await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        host: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            self.pacer.wait_turn(host).await;

            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let last_attempt = attempt + 1 >= max_attempts;

            let reason = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let final_url = resp.url().to_string();
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await.map_err(|source| FetchError::Network {
                            url: url.to_string(),
                            source,
                        })?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body: body.to_vec(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || last_attempt {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    format!("http status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || last_attempt
                    {
                        return Err(FetchError::Network {
                            url: url.to_string(),
                            source: err,
                        });
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(url, attempt = attempt + 1, ?delay, %reason, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
