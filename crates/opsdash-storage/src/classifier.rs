//! HTTP client for the external conversation classifier.
//!
//! The classifier is a rate- and cost-bounded remote capability that labels
//! batches of conversation texts. Individual items may fail while the rest of
//! the batch succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsdash_core::ClassificationResult;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyItem {
    pub id: String,
    pub text: String,
}

/// Per-item classifier answer: either `result` or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyOutcome {
    pub id: String,
    #[serde(default)]
    pub result: Option<ClassificationResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ClassifyOutcome {
    pub fn ok(id: impl Into<String>, result: ClassificationResult) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<ClassificationResult, String> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err("classifier returned neither result nor error".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("classifier http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("classifier is shutting down")]
    Closed,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, batch: &[ClassifyItem]) -> Result<Vec<ClassifyOutcome>, ClassifyError>;
}

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// At most `requests` classifier calls per `per`, refilled one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub per: Duration,
}

impl RateLimit {
    fn refill_interval(&self) -> Duration {
        self.per / self.requests.max(1)
    }
}

/// Token bucket shared by every batch sent through one client.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    bucket: Mutex<(u32, tokio::time::Instant)>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            bucket: Mutex::new((limit.requests.max(1), tokio::time::Instant::now())),
        }
    }

    /// Wait until a request may be sent.
    pub async fn acquire(&self) {
        let interval = self.limit.refill_interval();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let (tokens, last) = &mut *bucket;
                if !interval.is_zero() {
                    let earned = (last.elapsed().as_nanos() / interval.as_nanos()) as u32;
                    if earned > 0 {
                        *tokens = tokens.saturating_add(earned).min(self.limit.requests.max(1));
                        *last += interval * earned;
                    }
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                interval.saturating_sub(last.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Concurrent requests across all callers of this client.
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl ClassifierConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    items: &'a [ClassifyItem],
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    results: Vec<ClassifyOutcome>,
}

#[derive(Debug)]
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    global_limit: Arc<Semaphore>,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifyError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        let rate_limiter = config.rate_limit.map(RateLimiter::new);

        Ok(Self {
            client,
            endpoint: config.endpoint,
            api_key: config.api_key,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            rate_limiter,
            backoff: config.backoff,
        })
    }

    async fn post_once(&self, batch: &[ClassifyItem]) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&ClassifyRequest { items: batch });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, batch: &[ClassifyItem]) -> Result<Vec<ClassifyOutcome>, ClassifyError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| ClassifyError::Closed)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let span = info_span!("classify_batch", endpoint = %self.endpoint, items = batch.len());
        self.classify_with_retries(batch).instrument(span).await
    }
}

impl HttpClassifier {
    async fn classify_with_retries(
        &self,
        batch: &[ClassifyItem],
    ) -> Result<Vec<ClassifyOutcome>, ClassifyError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.post_once(batch).await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body: ClassifyResponse = resp.json().await?;
                        return Ok(body.results);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "classifier returned retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(ClassifyError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "classifier request failed, retrying");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ClassifyError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(ClassifyError::Request(err)),
            None => Err(ClassifyError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn outcome_prefers_the_error_field() {
        let outcome: ClassifyOutcome = serde_json::from_value(serde_json::json!({
            "id": "c-1",
            "result": {"prospect_services": ["oec"]},
            "error": "content filtered"
        }))
        .unwrap();
        assert_eq!(outcome.into_result(), Err("content filtered".to_string()));

        let empty = ClassifyOutcome {
            id: "c-2".into(),
            result: None,
            error: None,
        };
        assert!(empty.into_result().is_err());
    }

    #[tokio::test]
    async fn rate_limiter_spends_the_burst_then_paces_requests() {
        let limiter = RateLimiter::new(RateLimit {
            requests: 2,
            per: Duration::from_millis(400),
        });
        let started = tokio::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(150));

        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(190));
    }
}
