//! Bitget futures ("mix" v1) REST client
//!
//! Signed GET requests against the two order-history endpoints:
//! per-symbol history and product-type-wide history.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExchangeConfig;
use crate::models::{ExchangeOrder, OrderPage, ProductType, Side, TimeWindow};
use crate::scrapers::fetch_client::{FetchError, OrderHistorySource};

type HmacSha256 = Hmac<Sha256>;

const SYMBOL_HISTORY_PATH: &str = "/api/mix/v1/order/history";
const PRODUCT_HISTORY_PATH: &str = "/api/mix/v1/order/historyProductType";
const SUCCESS_CODE: &str = "00000";

/// Exchange codes for rejected keys, signatures, timestamps and passphrases.
const AUTH_ERROR_CODES: &[&str] = &[
    "40001", "40002", "40003", "40004", "40005", "40006", "40008", "40009", "40011", "40012",
    "40014", "40037",
];

#[derive(Clone)]
pub struct BitgetCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl BitgetCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BITGET_API_KEY").ok()?;
        let secret_key = std::env::var("BITGET_SECRET_KEY").ok()?;
        let passphrase = std::env::var("BITGET_PASSPHRASE").ok()?;

        if api_key.trim().is_empty() || secret_key.trim().is_empty() || passphrase.trim().is_empty() {
            return None;
        }

        Some(Self {
            api_key,
            secret_key,
            passphrase,
        })
    }
}

impl fmt::Debug for BitgetCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitgetCredentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct BitgetRestClient {
    client: Client,
    base_url: String,
    creds: BitgetCredentials,
}

impl BitgetRestClient {
    pub fn new(creds: BitgetCredentials, config: &ExchangeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build BitgetRestClient")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            creds,
        })
    }

    fn build_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, FetchError> {
        Url::parse_with_params(&format!("{}{}", self.base_url, path), params)
            .map_err(|e| FetchError::InvalidRequest(format!("bad url for {}: {}", path, e)))
    }

    /// Base64 HMAC-SHA256 over `timestamp + METHOD + path[?query] + body`.
    fn sign_request(&self, method: &str, request_path: &str, body: &str, timestamp: i64) -> Result<String, FetchError> {
        let message = format!("{}{}{}{}", timestamp, method, request_path, body);

        let mut mac = HmacSha256::new_from_slice(self.creds.secret_key.as_bytes())
            .map_err(|e| FetchError::Authentication(format!("HMAC key error: {}", e)))?;
        mac.update(message.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, url: &Url, timestamp: i64) -> Result<Vec<(&'static str, String)>, FetchError> {
        let request_path = match url.query() {
            Some(q) if !q.is_empty() => format!("{}?{}", url.path(), q),
            _ => url.path().to_string(),
        };
        let signature = self.sign_request(method, &request_path, "", timestamp)?;

        Ok(vec![
            ("ACCESS-KEY", self.creds.api_key.clone()),
            ("ACCESS-SIGN", signature),
            ("ACCESS-TIMESTAMP", timestamp.to_string()),
            ("ACCESS-PASSPHRASE", self.creds.passphrase.clone()),
            ("Content-Type", "application/json".to_string()),
            ("locale", "en-US".to_string()),
        ])
    }

    async fn signed_get(&self, url: Url) -> Result<HistoryData, FetchError> {
        let timestamp = Utc::now().timestamp_millis();
        let headers = self.auth_headers("GET", &url, timestamp)?;

        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await?;

        let envelope: Option<Envelope> = serde_json::from_str(&text).ok();
        let code = envelope.as_ref().and_then(|e| e.code.as_deref());
        let msg = envelope
            .as_ref()
            .and_then(|e| e.msg.clone())
            .unwrap_or_else(|| truncate(&text, 200));

        if !status.is_success() || code.map_or(false, |c| c != SUCCESS_CODE) {
            return Err(classify_failure(status, code, &msg, retry_after));
        }

        let envelope = envelope.ok_or_else(|| {
            FetchError::Decode(format!("unparseable response from {}: {}", url.path(), truncate(&text, 200)))
        })?;

        debug!(path = url.path(), "Bitget request ok");
        Ok(envelope.data.unwrap_or_default())
    }

    fn window_params(window: &TimeWindow, cursor: Option<&str>, page_size: u32) -> Vec<(&'static str, String)> {
        // The exchange treats endTime as inclusive.
        let mut params = vec![
            ("startTime", window.start.to_string()),
            ("endTime", (window.end - 1).max(window.start).to_string()),
            ("pageSize", page_size.to_string()),
            ("isPre", "false".to_string()),
        ];
        if let Some(c) = cursor {
            params.push(("lastEndId", c.to_string()));
        }
        params
    }
}

#[async_trait]
impl OrderHistorySource for BitgetRestClient {
    async fn symbol_orders_page(
        &self,
        symbol: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<OrderPage, FetchError> {
        let mut params = vec![("symbol", symbol.to_string())];
        params.extend(Self::window_params(window, cursor, page_size));
        let url = self.build_url(SYMBOL_HISTORY_PATH, &params)?;

        let data = self.signed_get(url).await?;
        Ok(data.into_page(page_size, None))
    }

    async fn product_orders_page(
        &self,
        product_type: ProductType,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<OrderPage, FetchError> {
        let mut params = vec![("productType", product_type.as_str().to_string())];
        params.extend(Self::window_params(window, cursor, page_size));
        let url = self.build_url(PRODUCT_HISTORY_PATH, &params)?;

        let data = self.signed_get(url).await?;
        Ok(data.into_page(page_size, Some(product_type)))
    }
}

/// Map an HTTP status plus exchange code onto the retry taxonomy.
pub fn classify_failure(
    status: StatusCode,
    code: Option<&str>,
    msg: &str,
    retry_after: Option<Duration>,
) -> FetchError {
    let detail = format!("HTTP {} code={} {}", status.as_u16(), code.unwrap_or("-"), msg);
    let lowered = msg.to_ascii_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS
        || code == Some("429")
        || lowered.contains("too many requests")
        || lowered.contains("rate limit")
    {
        return FetchError::RateLimited {
            message: detail,
            retry_after,
        };
    }
    if status.is_server_error() {
        return FetchError::Transient(detail);
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || code.map_or(false, |c| AUTH_ERROR_CODES.contains(&c))
    {
        return FetchError::Authentication(detail);
    }
    FetchError::InvalidRequest(detail)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ===== Wire types =====

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<HistoryData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryData {
    #[serde(default)]
    next_flag: Option<bool>,
    #[serde(default)]
    end_id: Option<String>,
    #[serde(default)]
    order_list: Option<Vec<WireOrder>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrder {
    symbol: String,
    order_id: serde_json::Value,
    side: String,
    #[serde(default)]
    size: Option<serde_json::Value>,
    #[serde(default)]
    price: Option<serde_json::Value>,
    #[serde(default)]
    price_avg: Option<serde_json::Value>,
    c_time: serde_json::Value,
}

impl HistoryData {
    fn into_page(self, page_size: u32, requested: Option<ProductType>) -> OrderPage {
        let raw = self.order_list.unwrap_or_default();
        let raw_len = raw.len();

        let orders: Vec<ExchangeOrder> = raw
            .into_iter()
            .filter_map(|w| {
                let parsed = w.into_exchange_order(requested);
                if parsed.is_none() {
                    warn!("Skipping unparseable Bitget order entry");
                }
                parsed
            })
            .collect();

        let more = match self.next_flag {
            Some(flag) => flag,
            None => raw_len as u32 >= page_size,
        };
        let next_cursor = if more && raw_len > 0 {
            self.end_id.filter(|id| !id.is_empty())
        } else {
            None
        };

        OrderPage { orders, next_cursor }
    }
}

impl WireOrder {
    fn into_exchange_order(self, requested: Option<ProductType>) -> Option<ExchangeOrder> {
        let order_id = value_to_string(&self.order_id)?;
        let side = Side::from_exchange(&self.side)?;
        let create_time = value_to_string(&self.c_time)?.parse::<i64>().ok()?;
        let size = self.size.as_ref().and_then(value_to_decimal).unwrap_or(Decimal::ZERO);
        let price = self
            .price
            .as_ref()
            .and_then(value_to_decimal)
            .filter(|p| !p.is_zero())
            .or_else(|| self.price_avg.as_ref().and_then(value_to_decimal))
            .unwrap_or(Decimal::ZERO);

        let product_type = if is_simulated_symbol(&self.symbol) {
            None
        } else {
            ProductType::from_symbol(&self.symbol).or(requested)
        };

        Some(ExchangeOrder {
            order_id,
            symbol: self.symbol,
            side,
            size,
            price,
            create_time,
            product_type,
        })
    }
}

fn is_simulated_symbol(symbol: &str) -> bool {
    symbol
        .rsplit_once('_')
        .map(|(_, suffix)| {
            let s = suffix.to_ascii_uppercase();
            s == "SPBL" || (s.starts_with('S') && s.ends_with("MCBL"))
        })
        .unwrap_or(false)
}

fn value_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_decimal(v: &serde_json::Value) -> Option<Decimal> {
    let s = value_to_string(v)?;
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> BitgetRestClient {
        BitgetRestClient::new(
            BitgetCredentials {
                api_key: "key".to_string(),
                secret_key: "secret".to_string(),
                passphrase: "phrase".to_string(),
            },
            &ExchangeConfig::default(),
        )
        .unwrap()
    }

    const SAMPLE: &str = r#"{
        "code": "00000",
        "msg": "success",
        "requestTime": 1700000000000,
        "data": {
            "nextFlag": true,
            "endId": "1002",
            "orderList": [
                {"symbol": "BTCUSDT_UMCBL", "orderId": "1001", "side": "open_long",
                 "size": 0.01, "price": 43000.5, "cTime": "1700000000100"},
                {"symbol": "BTCUSDT_UMCBL", "orderId": "1002", "side": "close_long",
                 "size": "0.01", "price": null, "priceAvg": "43100", "cTime": "1700000000200"},
                {"symbol": "SBTCSUSDT_SUMCBL", "orderId": "1003", "side": "buy_single",
                 "size": "1", "price": "1", "cTime": "1700000000300"}
            ]
        }
    }"#;

    #[test]
    fn test_parse_history_page() {
        let envelope: Envelope = serde_json::from_str(SAMPLE).unwrap();
        let page = envelope.data.unwrap().into_page(100, None);

        assert_eq!(page.next_cursor.as_deref(), Some("1002"));
        assert_eq!(page.orders.len(), 3);

        let first = &page.orders[0];
        assert_eq!(first.order_id, "1001");
        assert_eq!(first.side, Side::Buy);
        assert_eq!(first.product_type, Some(ProductType::Umcbl));
        assert_eq!(first.price, Decimal::from_str("43000.5").unwrap());
        assert_eq!(first.create_time, 1_700_000_000_100);

        let second = &page.orders[1];
        assert_eq!(second.side, Side::Sell);
        assert_eq!(second.price, Decimal::from(43100));

        assert_eq!(page.orders[2].product_type, None);
    }

    #[test]
    fn test_last_page_has_no_cursor() {
        let data = HistoryData {
            next_flag: Some(false),
            end_id: Some("9".to_string()),
            order_list: Some(vec![]),
        };
        assert!(data.into_page(100, None).next_cursor.is_none());
    }

    #[test]
    fn test_product_endpoint_falls_back_to_requested_type() {
        let wire = WireOrder {
            symbol: "BTCUSD".to_string(),
            order_id: serde_json::json!(77),
            side: "sell".to_string(),
            size: Some(serde_json::json!("2")),
            price: Some(serde_json::json!("10")),
            price_avg: None,
            c_time: serde_json::json!(5),
        };
        let order = wire.into_exchange_order(Some(ProductType::Dmcbl)).unwrap();
        assert_eq!(order.order_id, "77");
        assert_eq!(order.product_type, Some(ProductType::Dmcbl));
    }

    #[test]
    fn test_classify_failures() {
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, None, "slow down", None),
            FetchError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, Some("429"), "Too Many Requests", None),
            FetchError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, "upstream", None),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, Some("40009"), "sign signature error", None),
            FetchError::Authentication(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, Some("40034"), "Parameter does not exist", None),
            FetchError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_signature_covers_query() {
        let client = test_client();
        let window = TimeWindow::new(0, 1_000, 2_000);

        let mut params = vec![("symbol", "BTCUSDT_UMCBL".to_string())];
        params.extend(BitgetRestClient::window_params(&window, Some("55"), 100));
        let url = client.build_url(SYMBOL_HISTORY_PATH, &params).unwrap();

        let query = url.query().unwrap();
        assert!(query.contains("endTime=1999"));
        assert!(query.contains("lastEndId=55"));

        let headers = client.auth_headers("GET", &url, 1_700_000_000_000).unwrap();
        let sign = &headers.iter().find(|(k, _)| *k == "ACCESS-SIGN").unwrap().1;
        assert_eq!(BASE64.decode(sign).unwrap().len(), 32);

        let without_cursor = client
            .build_url(SYMBOL_HISTORY_PATH, &[("symbol", "BTCUSDT_UMCBL".to_string())])
            .unwrap();
        let other = client.auth_headers("GET", &without_cursor, 1_700_000_000_000).unwrap();
        assert_ne!(sign, &other.iter().find(|(k, _)| *k == "ACCESS-SIGN").unwrap().1);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = BitgetCredentials {
            api_key: "key".to_string(),
            secret_key: "hunter2".to_string(),
            passphrase: "phrase".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("phrase\""));
    }
}
