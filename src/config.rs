//! Pipeline configuration.
//!
//! Loaded from TOML (`ORDERS_CONFIG_PATH`, default `orders_config.toml`) and
//! then overridden by `ORDERS_*` environment variables. Exchange credentials
//! never live in the file; see [`crate::scrapers::bitget_rest::BitgetCredentials`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::models::{ProductType, MS_PER_DAY};
use crate::scrapers::MIN_REQUESTS_PER_SECOND;

/// What to do when a discovery window exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryFailurePolicy {
    /// Report the window with zero symbols, flag it, keep going.
    BestEffort,
    /// Abort the run before extraction starts.
    FailFast,
}

impl Default for DiscoveryFailurePolicy {
    fn default() -> Self {
        DiscoveryFailurePolicy::BestEffort
    }
}

impl FromStr for DiscoveryFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            other => Err(format!("unknown discovery failure policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    Filesystem,
    Sqlite,
    Memory,
}

impl FromStr for BlobBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown blob backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub horizon: HorizonConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            horizon: HorizonConfig::default(),
            discovery: DiscoveryConfig::default(),
            extraction: ExtractionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            exchange: ExchangeConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonConfig {
    /// How far back from "now" the horizon starts.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Discovery window width.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_lookback_days() -> u32 {
    8 * 365
}

fn default_window_days() -> u32 {
    90
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            window_days: default_window_days(),
        }
    }
}

impl HorizonConfig {
    pub fn lookback_ms(&self) -> i64 {
        self.lookback_days as i64 * MS_PER_DAY
    }

    pub fn window_ms(&self) -> i64 {
        self.window_days as i64 * MS_PER_DAY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Distinct symbols per window before early exit.
    #[serde(default = "default_symbol_cap")]
    pub symbol_cap: usize,
    /// Page cap per product type per window.
    #[serde(default = "default_discovery_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_discovery_page_size")]
    pub page_size: u32,
    #[serde(default = "default_discovery_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_product_types")]
    pub product_types: Vec<ProductType>,
    #[serde(default)]
    pub failure_policy: DiscoveryFailurePolicy,
}

fn default_symbol_cap() -> usize {
    360
}

fn default_discovery_max_pages() -> u32 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_discovery_page_size() -> u32 {
    1000
}

fn default_discovery_concurrency() -> usize {
    40
}

fn default_product_types() -> Vec<ProductType> {
    ProductType::ALL.to_vec()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            symbol_cap: default_symbol_cap(),
            max_pages: default_discovery_max_pages(),
            page_size: default_discovery_page_size(),
            concurrency: default_discovery_concurrency(),
            product_types: default_product_types(),
            failure_policy: DiscoveryFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Page cap per symbol; hitting it marks the symbol incomplete.
    #[serde(default = "default_extraction_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_extraction_concurrency")]
    pub concurrency: usize,
    /// Collector blob-read fan-out.
    #[serde(default = "default_collect_concurrency")]
    pub collect_concurrency: usize,
}

fn default_extraction_max_pages() -> u32 {
    1000
}

fn default_extraction_concurrency() -> usize {
    24
}

fn default_collect_concurrency() -> usize {
    16
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_pages: default_extraction_max_pages(),
            page_size: default_page_size(),
            concurrency: default_extraction_concurrency(),
            collect_concurrency: default_collect_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BlobBackend,
    /// Root directory for the filesystem backend.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// Remove per-symbol blobs once the final result is persisted.
    #[serde(default)]
    pub delete_intermediates: bool,
}

fn default_backend() -> BlobBackend {
    BlobBackend::Filesystem
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/blobs.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_blob_root(),
            sqlite_path: default_sqlite_path(),
            delete_intermediates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.bitget.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// File (if present) plus environment overrides, validated.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("ORDERS_CONFIG_PATH")
            .unwrap_or_else(|_| "orders_config.toml".to_string());

        let mut config = if Path::new(&path).exists() {
            Self::load(&path)?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        override_from_env("ORDERS_LOOKBACK_DAYS", &mut self.horizon.lookback_days);
        override_from_env("ORDERS_WINDOW_DAYS", &mut self.horizon.window_days);

        override_from_env("ORDERS_DISCOVERY_SYMBOL_CAP", &mut self.discovery.symbol_cap);
        override_from_env("ORDERS_DISCOVERY_MAX_PAGES", &mut self.discovery.max_pages);
        override_from_env("ORDERS_DISCOVERY_CONCURRENCY", &mut self.discovery.concurrency);
        override_from_env("ORDERS_DISCOVERY_FAILURE_POLICY", &mut self.discovery.failure_policy);
        if let Ok(v) = std::env::var("ORDERS_PRODUCT_TYPES") {
            let parsed: std::result::Result<Vec<ProductType>, _> =
                v.split(',').map(|s| s.trim().parse()).collect();
            match parsed {
                Ok(types) if !types.is_empty() => self.discovery.product_types = types,
                _ => tracing::warn!("Ignoring invalid ORDERS_PRODUCT_TYPES={}", v),
            }
        }

        override_from_env("ORDERS_EXTRACTION_MAX_PAGES", &mut self.extraction.max_pages);
        override_from_env("ORDERS_EXTRACTION_CONCURRENCY", &mut self.extraction.concurrency);
        override_from_env("ORDERS_COLLECT_CONCURRENCY", &mut self.extraction.collect_concurrency);

        override_from_env("ORDERS_REQUESTS_PER_SECOND", &mut self.rate_limit.requests_per_second);
        override_from_env("ORDERS_RATE_BURST", &mut self.rate_limit.burst);

        override_from_env("ORDERS_MAX_ATTEMPTS", &mut self.retry.max_attempts);
        override_from_env("ORDERS_BACKOFF_BASE_MS", &mut self.retry.backoff_base_ms);
        override_from_env("ORDERS_BACKOFF_MAX_MS", &mut self.retry.backoff_max_ms);

        override_from_env("ORDERS_BLOB_BACKEND", &mut self.storage.backend);
        if let Ok(v) = std::env::var("ORDERS_BLOB_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORDERS_SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(v);
        }
        override_from_env("ORDERS_DELETE_INTERMEDIATES", &mut self.storage.delete_intermediates);

        if let Ok(v) = std::env::var("BITGET_BASE_URL") {
            self.exchange.base_url = v;
        }
        if let Ok(v) = std::env::var("ORDERS_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizon.window_days == 0 {
            bail!("horizon.window_days must be positive");
        }
        if self.discovery.symbol_cap == 0 {
            bail!("discovery.symbol_cap must be positive");
        }
        if self.discovery.product_types.is_empty() {
            bail!("discovery.product_types must not be empty");
        }
        if self.discovery.concurrency == 0 || self.extraction.concurrency == 0 {
            bail!("stage concurrency must be positive");
        }
        if self.discovery.page_size == 0 || self.extraction.page_size == 0 {
            bail!("page_size must be positive");
        }
        let rps = self.rate_limit.requests_per_second;
        if rps.is_nan() || rps < MIN_REQUESTS_PER_SECOND {
            bail!(
                "rate_limit.requests_per_second must be at least {}",
                MIN_REQUESTS_PER_SECOND
            );
        }
        if self.rate_limit.burst == 0 {
            bail!("rate_limit.burst must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange.request_timeout_secs)
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring invalid {}={}", key, v),
        }
    }
}
