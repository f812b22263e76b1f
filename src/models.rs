//! Core data types shared by every pipeline stage.
//!
//! Timestamps are Unix epoch milliseconds throughout, matching the exchange.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::pipeline::analytics::OrderAnalytics;

pub const MS_PER_DAY: i64 = 86_400_000;

/// Half-open `[start, end)` slice of the lookback horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub id: u32,
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(id: u32, start: i64, end: i64) -> Self {
        Self { id, start, end }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    pub fn duration_days(&self) -> f64 {
        self.duration_ms() as f64 / MS_PER_DAY as f64
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn start_iso(&self) -> String {
        format_timestamp(self.start).unwrap_or_default()
    }

    pub fn end_iso(&self) -> String {
        format_timestamp(self.end).unwrap_or_default()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{} [{}, {})", self.id, self.start_iso(), self.end_iso())
    }
}

/// ISO-8601 rendering of an epoch-millisecond timestamp.
pub fn format_timestamp(ts_ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt: DateTime<Utc>| dt.to_rfc3339())
}

/// The three futures ("mix") product families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    /// USDT-margined perpetuals.
    Umcbl,
    /// Coin-margined perpetuals.
    Dmcbl,
    /// USDC-margined perpetuals.
    Cmcbl,
}

impl ProductType {
    pub const ALL: [ProductType; 3] = [ProductType::Umcbl, ProductType::Dmcbl, ProductType::Cmcbl];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Umcbl => "umcbl",
            ProductType::Dmcbl => "dmcbl",
            ProductType::Cmcbl => "cmcbl",
        }
    }

    /// Product type from the exchange symbol suffix (`BTCUSDT_UMCBL`).
    ///
    /// Spot (`_SPBL`) and simulated (`_SUMCBL`, `_SDMCBL`, `_SCMCBL`) symbols
    /// have no futures product type and yield `None`.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let (_, suffix) = symbol.rsplit_once('_')?;
        suffix.parse().ok()
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "umcbl" => Ok(ProductType::Umcbl),
            "dmcbl" => Ok(ProductType::Dmcbl),
            "cmcbl" => Ok(ProductType::Cmcbl),
            other => Err(format!("unknown futures product type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Maps exchange side strings onto buy/sell.
    ///
    /// One-way mode reports `buy`/`sell`; hedge mode reports
    /// `open_long`, `close_short` (buys) and `open_short`, `close_long` (sells).
    pub fn from_exchange(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "buy_single" | "open_long" | "close_short" => Some(Side::Buy),
            "sell" | "sell_single" | "open_short" | "close_long" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// One historical futures order. Identity is `order_id` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub create_time: i64,
    pub product_type: ProductType,
}

/// An order as the exchange reported it, before the futures-only filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub create_time: i64,
    /// `None` for spot, simulated, or unrecognised products.
    pub product_type: Option<ProductType>,
}

impl ExchangeOrder {
    pub fn into_futures_order(self) -> Option<Order> {
        let product_type = self.product_type?;
        Some(Order {
            order_id: self.order_id,
            symbol: self.symbol,
            side: self.side,
            size: self.size,
            price: self.price,
            create_time: self.create_time,
            product_type,
        })
    }
}

/// One page of order history plus the continuation cursor, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderPage {
    pub orders: Vec<ExchangeOrder>,
    pub next_cursor: Option<String>,
}

/// A symbol seen inside one discovery window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolObservation {
    pub symbol: String,
    pub window: TimeWindow,
    pub first_seen: i64,
}

/// How many windows a symbol appeared in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFrequency {
    pub symbol: String,
    pub windows: u32,
    pub first_seen: i64,
}

/// Unique symbols, most active first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedSymbolList {
    pub symbols: Vec<String>,
    pub frequencies: Vec<SymbolFrequency>,
}

impl UnifiedSymbolList {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Per-symbol extraction output written to blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolResultBlob {
    pub run_id: String,
    pub symbol: String,
    /// False when pagination stopped early (fetch failure or page cap).
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pages_fetched: u32,
    pub duplicates_skipped: u64,
    pub filtered_out: u64,
    pub extracted_at: i64,
    pub orders: Vec<Order>,
}

/// Location of a symbol result blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: String,
}

impl BlobRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub earliest: Option<String>,
    pub latest: Option<String>,
    pub earliest_timestamp: Option<i64>,
    pub latest_timestamp: Option<i64>,
    pub total_days: f64,
}

impl DateRange {
    pub fn from_bounds(earliest: Option<i64>, latest: Option<i64>) -> Self {
        let total_days = match (earliest, latest) {
            (Some(lo), Some(hi)) => {
                let days = (hi - lo) as f64 / MS_PER_DAY as f64;
                (days * 100.0).round() / 100.0
            }
            _ => 0.0,
        };
        Self {
            earliest: earliest.and_then(format_timestamp),
            latest: latest.and_then(format_timestamp),
            earliest_timestamp: earliest,
            latest_timestamp: latest,
            total_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableBlob {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedWindow {
    pub window: TimeWindow,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSymbol {
    pub symbol: String,
    pub error: String,
}

/// Run-level bookkeeping attached to the final result by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub horizon: Option<TimeWindow>,
    pub windows_total: usize,
    pub windows_failed: Vec<FailedWindow>,
    pub windows_capped: Vec<u32>,
    #[serde(default)]
    pub windows_page_limited: Vec<u32>,
    pub symbols_requested: usize,
    pub symbols_failed: Vec<FailedSymbol>,
    /// True only if every window and every symbol finished cleanly.
    pub complete: bool,
}

/// The merged, deduplicated, time-ordered output of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub message: String,
    pub total_orders: usize,
    pub symbols_processed: usize,
    #[serde(default)]
    pub symbols_incomplete: Vec<String>,
    #[serde(default)]
    pub unreadable_blobs: Vec<UnreadableBlob>,
    #[serde(default)]
    pub duplicates_removed: usize,
    pub date_range: DateRange,
    #[serde(default)]
    pub orders_by_symbol: BTreeMap<String, usize>,
    #[serde(default)]
    pub run: RunMetadata,
    #[serde(default)]
    pub analytics: OrderAnalytics,
    pub orders: Vec<Order>,
}

impl FinalResult {
    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            message: self.message.clone(),
            total_orders: self.total_orders,
            symbols_processed: self.symbols_processed,
            symbols_incomplete: self.symbols_incomplete.clone(),
            symbols_failed: self.run.symbols_failed.clone(),
            windows_failed: self.run.windows_failed.len(),
            windows_page_limited: self.run.windows_page_limited.len(),
            unreadable_blobs: self.unreadable_blobs.len(),
            date_range: self.date_range.clone(),
            complete: self.run.complete,
        }
    }
}

/// `FinalResult` without the order payload, for status responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub message: String,
    pub total_orders: usize,
    pub symbols_processed: usize,
    pub symbols_incomplete: Vec<String>,
    pub symbols_failed: Vec<FailedSymbol>,
    pub windows_failed: usize,
    pub windows_page_limited: usize,
    pub unreadable_blobs: usize,
    pub date_range: DateRange,
    pub complete: bool,
}
