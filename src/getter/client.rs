//! Async HTTP client with bounded retries, backoff and a cap on requests in flight.

use crate::getter::GetterError;
use reqwest::header::RETRY_AFTER;
use reqwest::{IntoUrl, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;

/// Default number of attempts per request (initial plus retries).
const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default backoff after each failed attempt (1s, 2s, 4s).
const DEFAULT_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
const DEFAULT_MAX_IN_FLIGHT: usize = 4;
/// Upper bound honoured for a server-supplied Retry-After.
const MAX_RETRY_AFTER_SECS: u64 = 120;

/// Shared HTTP client for one run. Cheap to clone; clones share the connection pool,
/// the cookie store and the in-flight limit.
#[derive(Debug, Clone)]
pub struct RetryClient {
    inner: reqwest::Client,
    retry_count: u32,
    backoff: Vec<Duration>,
    limiter: Arc<Semaphore>,
}

impl RetryClient {
    /// Client with default User-Agent, timeout and retry policy.
    pub fn new() -> Result<Self, GetterError> {
        Self::builder().build()
    }

    pub fn builder() -> RetryClientBuilder {
        RetryClientBuilder::default()
    }

    pub fn get(&self, url: impl IntoUrl) -> RequestBuilder {
        self.inner.get(url)
    }

    pub fn post(&self, url: impl IntoUrl) -> RequestBuilder {
        self.inner.post(url)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Send a request, retrying transient failures.
    ///
    /// Retries on timeouts, connection errors, HTTP 5xx and HTTP 429, waiting the
    /// configured backoff between attempts. Any other status is returned as-is for the
    /// caller to judge. Requests whose body cannot be cloned get a single attempt.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, GetterError> {
        let request = request.build().map_err(|e| GetterError::Network {
            url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            source: e,
        })?;
        let url = request.url().to_string();

        let mut attempt = 1;
        let mut current = request;
        loop {
            let next = if attempt < self.retry_count {
                current.try_clone()
            } else {
                None
            };
            let result = self.execute(current).await;
            let Some(next) = next else {
                return result.map_err(|source| GetterError::Network { url, source });
            };

            let delay = match result {
                Ok(response) if is_retryable_status(response.status()) => {
                    warn!(
                        url = %url,
                        status = response.status().as_u16(),
                        attempt,
                        "transient HTTP status, retrying"
                    );
                    retry_after(&response).unwrap_or_else(|| self.backoff_for(attempt))
                }
                Ok(response) => return Ok(response),
                Err(e) if is_retryable_error(&e) => {
                    warn!(url = %url, error = %e, attempt, "request failed, retrying");
                    self.backoff_for(attempt)
                }
                Err(source) => return Err(GetterError::Network { url, source }),
            };
            tokio::time::sleep(delay).await;
            current = next;
            attempt += 1;
        }
    }

    /// Send with retries and require a 2xx status. `context` names the request in errors.
    pub async fn send_ok(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<Response, GetterError> {
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GetterError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
                context: context.to_string(),
            });
        }
        Ok(response)
    }

    pub async fn text(&self, request: RequestBuilder, context: &str) -> Result<String, GetterError> {
        let response = self.send_ok(request, context).await?;
        let url = response.url().to_string();
        response
            .text()
            .await
            .map_err(|source| GetterError::BodyRead { url, source })
    }

    pub async fn bytes(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<Vec<u8>, GetterError> {
        let response = self.send_ok(request, context).await?;
        let url = response.url().to_string();
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|source| GetterError::BodyRead { url, source })
    }

    pub async fn json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<T, GetterError> {
        let response = self.send_ok(request, context).await?;
        parse_json(response).await
    }

    async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
        // The semaphore is never closed; a closed one just stops limiting.
        let _permit = self.limiter.acquire().await.ok();
        debug!(method = %request.method(), url = %request.url(), "sending request");
        self.inner.execute(request).await
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .get(attempt as usize - 1)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Read a response body as JSON, keeping the URL for error messages.
pub async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, GetterError> {
    let url = response.url().to_string();
    let body = response
        .bytes()
        .await
        .map_err(|source| GetterError::BodyRead {
            url: url.clone(),
            source,
        })?;
    serde_json::from_slice(&body).map_err(|source| GetterError::Json { url, source })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

fn retry_after(response: &Response) -> Option<Duration> {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let secs: u64 = response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)))
}

/// Builder for [RetryClient].
#[derive(Debug)]
pub struct RetryClientBuilder {
    user_agent: Option<String>,
    timeout: Duration,
    retry_count: u32,
    retry_backoff: Vec<Duration>,
    max_in_flight: usize,
}

impl Default for RetryClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl RetryClientBuilder {
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Default per-attempt timeout. Getters may override it per request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of attempts per request, at least 1.
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n.max(1);
        self
    }

    /// Delay before each retry. If shorter than `retry_count - 1`, the last value is reused.
    pub fn retry_backoff(mut self, delays: Vec<Duration>) -> Self {
        self.retry_backoff = delays;
        self
    }

    /// Maximum number of requests outstanding at once across all clones.
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    pub fn build(self) -> Result<RetryClient, GetterError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let inner = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(GetterError::Client)?;
        Ok(RetryClient {
            inner,
            retry_count: self.retry_count,
            backoff: self.retry_backoff,
            limiter: Arc::new(Semaphore::new(self.max_in_flight)),
        })
    }
}
