//! Exchange page-fetch contract and the rate-limited, retrying wrapper
//! every pipeline unit talks through.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::models::{OrderPage, ProductType, TimeWindow};
use crate::scrapers::rate_limit::TokenBucket;

/// Classified exchange failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// HTTP 429 or an exchange rate-limit code.
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Network, timeout, or 5xx.
    Transient(String),
    /// Bad or missing credentials, signature rejected.
    Authentication(String),
    /// The exchange rejected the request parameters.
    InvalidRequest(String),
    /// The response body could not be decoded.
    Decode(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. } | FetchError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Transient(_) => "transient",
            FetchError::Authentication(_) => "authentication",
            FetchError::InvalidRequest(_) => "invalid_request",
            FetchError::Decode(_) => "decode",
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::RateLimited { message, .. } => write!(f, "Rate limited: {}", message),
            FetchError::Transient(msg) => write!(f, "Transient error: {}", msg),
            FetchError::Authentication(msg) => write!(f, "Authentication error: {}", msg),
            FetchError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            FetchError::Decode(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else if e.is_builder() {
            FetchError::InvalidRequest(e.to_string())
        } else {
            FetchError::Transient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

/// One page of exchange order history per call.
#[async_trait]
pub trait OrderHistorySource: Send + Sync {
    /// Orders for one symbol created inside `window`.
    async fn symbol_orders_page(
        &self,
        symbol: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<OrderPage, FetchError>;

    /// Orders across every symbol of a product type created inside `window`.
    async fn product_orders_page(
        &self,
        product_type: ProductType,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<OrderPage, FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier.max(1),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Rate-limited, retrying front for an [`OrderHistorySource`].
pub struct RateLimitedFetchClient {
    source: Arc<dyn OrderHistorySource>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
}

impl RateLimitedFetchClient {
    pub fn new(
        source: Arc<dyn OrderHistorySource>,
        limiter: Arc<TokenBucket>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
        }
    }

    pub async fn fetch_order_page(
        &self,
        symbol: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<OrderPage, FetchError> {
        self.with_retry(symbol, || {
            self.source
                .symbol_orders_page(symbol, window, cursor, page_size)
        })
        .await
    }

    pub async fn fetch_product_page(
        &self,
        product_type: ProductType,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<OrderPage, FetchError> {
        self.with_retry(product_type.as_str(), || {
            self.source
                .product_orders_page(product_type, window, cursor, page_size)
        })
        .await
    }

    async fn with_retry<F, Fut>(&self, target: &str, call: F) -> Result<OrderPage, FetchError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<OrderPage, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            self.limiter.acquire().await;

            match call().await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let mut delay = self.retry.delay_for(attempt);
                    if let FetchError::RateLimited {
                        retry_after: Some(server_delay),
                        ..
                    } = &e
                    {
                        delay = delay.max(*server_delay);
                    }
                    warn!(
                        target_name = %target,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        kind = e.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Exchange request failed, backing off: {}",
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(target_name = %target, attempt, kind = e.kind(), "Giving up on request");
                    return Err(e);
                }
            }
        }
    }
}
