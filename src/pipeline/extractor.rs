//! Per-symbol order extraction.
//!
//! Pages a symbol's full history across the horizon, drops repeats and
//! non-futures records, and writes the result set to blob storage. Only the
//! blob reference travels back to the coordinator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::models::{BlobRef, Order, SymbolResultBlob, TimeWindow};
use crate::scrapers::RateLimitedFetchClient;
use crate::storage::{put_with_retry, symbol_result_key, BlobStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionStatus {
    Complete,
    /// A blob was written but pagination stopped early.
    Incomplete { reason: String },
    /// No blob was written.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolExtraction {
    pub symbol: String,
    pub blob: Option<BlobRef>,
    pub orders: usize,
    pub pages_fetched: u32,
    pub status: ExtractionStatus,
}

impl SymbolExtraction {
    fn failed(symbol: &str, pages_fetched: u32, reason: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            blob: None,
            orders: 0,
            pages_fetched,
            status: ExtractionStatus::Failed { reason },
        }
    }
}

pub struct SymbolOrderExtractor {
    client: Arc<RateLimitedFetchClient>,
    store: Arc<dyn BlobStore>,
    horizon: TimeWindow,
    page_size: u32,
    max_pages: u32,
}

impl SymbolOrderExtractor {
    pub fn new(
        client: Arc<RateLimitedFetchClient>,
        store: Arc<dyn BlobStore>,
        horizon: TimeWindow,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            client,
            store,
            horizon,
            page_size: config.page_size,
            max_pages: config.max_pages.max(1),
        }
    }

    pub async fn extract(&self, run_id: &str, symbol: &str) -> SymbolExtraction {
        let mut seen: HashSet<String> = HashSet::new();
        let mut orders: Vec<Order> = Vec::new();
        let mut duplicates_skipped = 0u64;
        let mut filtered_out = 0u64;
        let mut pages_fetched = 0u32;
        let mut cursor: Option<String> = None;
        let mut stop_reason: Option<String> = None;

        loop {
            if pages_fetched >= self.max_pages {
                stop_reason = Some(format!("page limit of {} reached", self.max_pages));
                break;
            }

            let page = match self
                .client
                .fetch_order_page(symbol, &self.horizon, cursor.as_deref(), self.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(symbol = %symbol, pages = pages_fetched, "Extraction stopped: {}", e);
                    stop_reason = Some(e.to_string());
                    break;
                }
            };
            pages_fetched += 1;

            for raw in page.orders {
                let Some(order) = raw.into_futures_order() else {
                    filtered_out += 1;
                    continue;
                };
                if seen.insert(order.order_id.clone()) {
                    orders.push(order);
                } else {
                    duplicates_skipped += 1;
                }
            }

            debug!(symbol = %symbol, page = pages_fetched, orders = orders.len(), "Fetched page");

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        if let (Some(reason), true) = (&stop_reason, orders.is_empty()) {
            return SymbolExtraction::failed(symbol, pages_fetched, reason.clone());
        }

        let complete = stop_reason.is_none();
        let blob = SymbolResultBlob {
            run_id: run_id.to_string(),
            symbol: symbol.to_string(),
            complete,
            error: stop_reason.clone(),
            pages_fetched,
            duplicates_skipped,
            filtered_out,
            extracted_at: Utc::now().timestamp_millis(),
            orders,
        };
        let order_count = blob.orders.len();

        let bytes = match serde_json::to_vec(&blob) {
            Ok(bytes) => bytes,
            Err(e) => return SymbolExtraction::failed(symbol, pages_fetched, e.to_string()),
        };

        let key = symbol_result_key(run_id, symbol);
        if let Err(e) = put_with_retry(self.store.as_ref(), &key, bytes).await {
            warn!(symbol = %symbol, key = %key, "Failed to store symbol result: {}", e);
            return SymbolExtraction::failed(symbol, pages_fetched, format!("storage: {}", e));
        }

        info!(
            symbol = %symbol,
            orders = order_count,
            pages = pages_fetched,
            duplicates = duplicates_skipped,
            filtered = filtered_out,
            complete,
            "Symbol extraction finished"
        );

        SymbolExtraction {
            symbol: symbol.to_string(),
            blob: Some(BlobRef::new(key)),
            orders: order_count,
            pages_fetched,
            status: match stop_reason {
                None => ExtractionStatus::Complete,
                Some(reason) => ExtractionStatus::Incomplete { reason },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExchangeOrder, OrderPage, ProductType, Side};
    use crate::scrapers::{FetchError, OrderHistorySource, RetryPolicy, TokenBucket};
    use crate::storage::{BlobStoreError, MemoryBlobStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct PagedSource {
        pages: Mutex<VecDeque<Result<OrderPage, FetchError>>>,
    }

    #[async_trait]
    impl OrderHistorySource for PagedSource {
        async fn symbol_orders_page(
            &self,
            _symbol: &str,
            _window: &TimeWindow,
            _cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<OrderPage, FetchError> {
            self.pages.lock().pop_front().unwrap_or_else(|| Ok(OrderPage::default()))
        }

        async fn product_orders_page(
            &self,
            _product_type: ProductType,
            _window: &TimeWindow,
            _cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<OrderPage, FetchError> {
            Ok(OrderPage::default())
        }
    }

    /// Accepts nothing; every write fails.
    struct FullDisk;

    #[async_trait]
    impl BlobStore for FullDisk {
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), BlobStoreError> {
            Err(BlobStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
            Ok(None)
        }

        async fn list_by_prefix(&self, _prefix: &str) -> Result<Vec<String>, BlobStoreError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _key: &str) -> Result<(), BlobStoreError> {
            Ok(())
        }
    }

    fn raw(id: &str, ts: i64, product_type: Option<ProductType>) -> ExchangeOrder {
        ExchangeOrder {
            order_id: id.to_string(),
            symbol: "BTCUSDT_UMCBL".to_string(),
            side: Side::Buy,
            size: Decimal::ONE,
            price: Decimal::from(100),
            create_time: ts,
            product_type,
        }
    }

    fn page(orders: Vec<ExchangeOrder>, next: Option<&str>) -> Result<OrderPage, FetchError> {
        Ok(OrderPage {
            orders,
            next_cursor: next.map(str::to_string),
        })
    }

    fn extractor(
        pages: Vec<Result<OrderPage, FetchError>>,
        store: Arc<dyn BlobStore>,
        max_pages: u32,
    ) -> SymbolOrderExtractor {
        let source = PagedSource {
            pages: Mutex::new(pages.into()),
        };
        let client = RateLimitedFetchClient::new(
            Arc::new(source),
            Arc::new(TokenBucket::new(10_000.0, 1_000)),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                multiplier: 2,
                max_delay: Duration::ZERO,
            },
        );
        let config = ExtractionConfig {
            max_pages,
            ..ExtractionConfig::default()
        };
        SymbolOrderExtractor::new(Arc::new(client), store, TimeWindow::new(0, 0, 1_000), &config)
    }

    async fn read_blob(store: &MemoryBlobStore, key: &str) -> SymbolResultBlob {
        let bytes = store.get(key).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_overlapping_pages_are_deduplicated() {
        let store = Arc::new(MemoryBlobStore::new());
        let pages = vec![
            page(vec![raw("A", 300, Some(ProductType::Umcbl)), raw("B", 200, Some(ProductType::Umcbl))], Some("B")),
            page(vec![raw("B", 200, Some(ProductType::Umcbl)), raw("C", 100, Some(ProductType::Umcbl))], None),
        ];
        let result = extractor(pages, store.clone(), 10).extract("run-1", "BTCUSDT_UMCBL").await;

        assert_eq!(result.status, ExtractionStatus::Complete);
        assert_eq!(result.orders, 3);
        let key = result.blob.unwrap().key;
        assert_eq!(key, "symbol_results/run-1/BTCUSDT_UMCBL.json");

        let blob = read_blob(&store, &key).await;
        let ids: Vec<&str> = blob.orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(blob.duplicates_skipped, 1);
        assert!(blob.complete);
    }

    #[tokio::test]
    async fn test_non_futures_orders_are_filtered() {
        let store = Arc::new(MemoryBlobStore::new());
        let pages = vec![page(vec![raw("A", 1, Some(ProductType::Umcbl)), raw("S", 2, None)], None)];
        let result = extractor(pages, store.clone(), 10).extract("r", "BTCUSDT_UMCBL").await;

        let blob = read_blob(&store, &result.blob.unwrap().key).await;
        assert_eq!(blob.orders.len(), 1);
        assert_eq!(blob.filtered_out, 1);
    }

    #[tokio::test]
    async fn test_failure_after_progress_writes_partial_blob() {
        let store = Arc::new(MemoryBlobStore::new());
        let pages = vec![
            page(vec![raw("A", 1, Some(ProductType::Umcbl))], Some("A")),
            Err(FetchError::Transient("reset".into())),
        ];
        let result = extractor(pages, store.clone(), 10).extract("r", "BTCUSDT_UMCBL").await;

        assert!(matches!(result.status, ExtractionStatus::Incomplete { .. }));
        let blob = read_blob(&store, &result.blob.unwrap().key).await;
        assert!(!blob.complete);
        assert_eq!(blob.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_before_any_page_writes_nothing() {
        let store = Arc::new(MemoryBlobStore::new());
        let pages = vec![Err(FetchError::Authentication("bad key".into()))];
        let result = extractor(pages, store.clone(), 10).extract("r", "BTCUSDT_UMCBL").await;

        assert!(matches!(result.status, ExtractionStatus::Failed { .. }));
        assert!(result.blob.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_page_cap_marks_incomplete() {
        let store = Arc::new(MemoryBlobStore::new());
        let pages = vec![
            page(vec![raw("A", 3, Some(ProductType::Umcbl))], Some("1")),
            page(vec![raw("B", 2, Some(ProductType::Umcbl))], Some("2")),
            page(vec![raw("C", 1, Some(ProductType::Umcbl))], None),
        ];
        let result = extractor(pages, store.clone(), 2).extract("r", "BTCUSDT_UMCBL").await;

        assert_eq!(result.pages_fetched, 2);
        assert_eq!(result.orders, 2);
        assert!(matches!(result.status, ExtractionStatus::Incomplete { .. }));
    }

    #[tokio::test]
    async fn test_blob_write_failure_fails_the_symbol() {
        let pages = vec![page(vec![raw("A", 1, Some(ProductType::Umcbl))], None)];
        let result = extractor(pages, Arc::new(FullDisk), 10).extract("r", "BTCUSDT_UMCBL").await;

        assert!(result.blob.is_none());
        assert_eq!(result.pages_fetched, 1);
        match result.status {
            ExtractionStatus::Failed { reason } => assert!(reason.starts_with("storage:")),
            other => panic!("unexpected status {:?}", other),
        }
    }
}
