//! Per-window symbol discovery.
//!
//! Each unit lists every order of every configured product type inside one
//! window and reports the distinct symbols it saw. It stops early once the
//! distinct-symbol cap is reached.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::models::{ProductType, SymbolObservation, TimeWindow};
use crate::scrapers::RateLimitedFetchClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscoveryOutcome {
    Complete,
    /// The distinct-symbol cap was hit; listing stopped early.
    Capped,
    /// The page budget ran out while the exchange still had more pages.
    PageLimited,
    /// Retries exhausted; the window reports zero symbols.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDiscovery {
    pub window: TimeWindow,
    pub observations: Vec<SymbolObservation>,
    pub outcome: DiscoveryOutcome,
    pub pages_fetched: u32,
}

impl WindowDiscovery {
    pub fn symbols(&self) -> BTreeSet<String> {
        self.observations.iter().map(|o| o.symbol.clone()).collect()
    }

    pub fn failed(window: TimeWindow, error: impl Into<String>, pages_fetched: u32) -> Self {
        Self {
            window,
            observations: Vec::new(),
            outcome: DiscoveryOutcome::Failed {
                error: error.into(),
            },
            pages_fetched,
        }
    }
}

pub struct SymbolDiscoveryUnit {
    client: Arc<RateLimitedFetchClient>,
    product_types: Vec<ProductType>,
    symbol_cap: usize,
    max_pages: u32,
    page_size: u32,
}

impl SymbolDiscoveryUnit {
    pub fn new(client: Arc<RateLimitedFetchClient>, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            product_types: config.product_types.clone(),
            symbol_cap: config.symbol_cap.max(1),
            max_pages: config.max_pages.max(1),
            page_size: config.page_size,
        }
    }

    pub async fn discover(&self, window: TimeWindow) -> WindowDiscovery {
        // symbol -> earliest createTime seen
        let mut first_seen: BTreeMap<String, i64> = BTreeMap::new();
        let mut pages_fetched = 0u32;
        let mut capped = false;
        let mut page_limited = false;

        'product: for product_type in &self.product_types {
            let mut cursor: Option<String> = None;
            let mut product_pages = 0u32;

            loop {
                if product_pages >= self.max_pages {
                    warn!(
                        window = window.id,
                        product_type = %product_type,
                        max_pages = self.max_pages,
                        "Discovery page budget exhausted with pages remaining"
                    );
                    page_limited = true;
                    break;
                }

                let page = match self
                    .client
                    .fetch_product_page(*product_type, &window, cursor.as_deref(), self.page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(
                            window = window.id,
                            product_type = %product_type,
                            "Symbol discovery failed: {}",
                            e
                        );
                        return WindowDiscovery::failed(window, e.to_string(), pages_fetched);
                    }
                };
                pages_fetched += 1;
                product_pages += 1;

                for order in &page.orders {
                    if order.product_type.is_none() {
                        continue;
                    }
                    first_seen
                        .entry(order.symbol.clone())
                        .and_modify(|t| *t = (*t).min(order.create_time))
                        .or_insert(order.create_time);
                }

                if first_seen.len() >= self.symbol_cap {
                    capped = true;
                    break 'product;
                }

                match page.next_cursor {
                    Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                    _ => break,
                }
            }

            debug!(
                window = window.id,
                product_type = %product_type,
                symbols = first_seen.len(),
                "Product type scan done"
            );
        }

        let observations: Vec<SymbolObservation> = first_seen
            .into_iter()
            .map(|(symbol, first_seen)| SymbolObservation {
                symbol,
                window,
                first_seen,
            })
            .collect();

        info!(
            window = window.id,
            start = %window.start_iso(),
            symbols = observations.len(),
            pages = pages_fetched,
            capped,
            page_limited,
            "Window discovery finished"
        );

        WindowDiscovery {
            window,
            observations,
            outcome: if capped {
                DiscoveryOutcome::Capped
            } else if page_limited {
                DiscoveryOutcome::PageLimited
            } else {
                DiscoveryOutcome::Complete
            },
            pages_fetched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExchangeOrder, OrderPage, Side};
    use crate::scrapers::{FetchError, OrderHistorySource, RetryPolicy, TokenBucket};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::time::Duration;

    /// Product listing served from a fixed list of `(symbol, createTime)`,
    /// `per_page` entries per page with the page index as cursor.
    struct ListingSource {
        entries: Vec<(&'static str, i64)>,
        per_page: usize,
        fail: bool,
    }

    #[async_trait]
    impl OrderHistorySource for ListingSource {
        async fn symbol_orders_page(
            &self,
            _symbol: &str,
            _window: &TimeWindow,
            _cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<OrderPage, FetchError> {
            Ok(OrderPage::default())
        }

        async fn product_orders_page(
            &self,
            product_type: ProductType,
            _window: &TimeWindow,
            cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<OrderPage, FetchError> {
            if self.fail {
                return Err(FetchError::Transient("connection reset".into()));
            }
            if product_type != ProductType::Umcbl {
                return Ok(OrderPage::default());
            }
            let page: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let chunk: Vec<ExchangeOrder> = self
                .entries
                .iter()
                .skip(page * self.per_page)
                .take(self.per_page)
                .enumerate()
                .map(|(i, (symbol, ts))| ExchangeOrder {
                    order_id: format!("{}-{}", page, i),
                    symbol: symbol.to_string(),
                    side: Side::Buy,
                    size: Decimal::ONE,
                    price: Decimal::ONE,
                    create_time: *ts,
                    product_type: Some(ProductType::Umcbl),
                })
                .collect();
            let more = (page + 1) * self.per_page < self.entries.len();
            Ok(OrderPage {
                orders: chunk,
                next_cursor: more.then(|| (page + 1).to_string()),
            })
        }
    }

    fn unit(source: ListingSource, cap: usize) -> SymbolDiscoveryUnit {
        unit_with_pages(source, cap, DiscoveryConfig::default().max_pages)
    }

    fn unit_with_pages(source: ListingSource, cap: usize, max_pages: u32) -> SymbolDiscoveryUnit {
        let client = RateLimitedFetchClient::new(
            Arc::new(source),
            Arc::new(TokenBucket::new(10_000.0, 1_000)),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::ZERO,
                multiplier: 2,
                max_delay: Duration::ZERO,
            },
        );
        let config = DiscoveryConfig {
            symbol_cap: cap,
            max_pages,
            ..DiscoveryConfig::default()
        };
        SymbolDiscoveryUnit::new(Arc::new(client), &config)
    }

    #[tokio::test]
    async fn test_collects_distinct_symbols_with_first_seen() {
        let source = ListingSource {
            entries: vec![("ETHUSDT", 50), ("BTCUSDT", 40), ("ETHUSDT", 10), ("BTCUSDT", 90)],
            per_page: 2,
            fail: false,
        };
        let result = unit(source, 360).discover(TimeWindow::new(3, 0, 100)).await;

        assert_eq!(result.outcome, DiscoveryOutcome::Complete);
        assert_eq!(result.pages_fetched, 2 + 2);
        let seen: Vec<(String, i64)> = result
            .observations
            .iter()
            .map(|o| (o.symbol.clone(), o.first_seen))
            .collect();
        assert_eq!(seen, vec![("BTCUSDT".to_string(), 40), ("ETHUSDT".to_string(), 10)]);
        assert!(result.observations.iter().all(|o| o.window.id == 3));
    }

    #[tokio::test]
    async fn test_early_exit_at_cap() {
        let source = ListingSource {
            entries: vec![("A", 1), ("B", 2), ("C", 3), ("D", 4), ("E", 5), ("F", 6)],
            per_page: 2,
            fail: false,
        };
        let result = unit(source, 3).discover(TimeWindow::new(0, 0, 100)).await;

        assert_eq!(result.outcome, DiscoveryOutcome::Capped);
        assert_eq!(result.pages_fetched, 2);
        assert_eq!(result.observations.len(), 4);
    }

    #[tokio::test]
    async fn test_failure_reports_zero_symbols() {
        let source = ListingSource {
            entries: vec![("A", 1)],
            per_page: 2,
            fail: true,
        };
        let result = unit(source, 360).discover(TimeWindow::new(1, 0, 100)).await;

        assert!(result.observations.is_empty());
        assert!(matches!(result.outcome, DiscoveryOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_page_budget_exhaustion_is_flagged() {
        let source = ListingSource {
            entries: vec![("AAA", 1), ("AAA", 2), ("AAA", 3), ("AAA", 4), ("ZZZ", 5)],
            per_page: 2,
            fail: false,
        };
        let result = unit_with_pages(source, 360, 2).discover(TimeWindow::new(4, 0, 100)).await;

        assert_eq!(result.outcome, DiscoveryOutcome::PageLimited);
        assert_eq!(result.symbols().into_iter().collect::<Vec<_>>(), vec!["AAA"]);
    }

    #[tokio::test]
    async fn test_last_page_within_budget_is_complete() {
        let source = ListingSource {
            entries: vec![("AAA", 1), ("AAA", 2), ("AAA", 3), ("ZZZ", 4)],
            per_page: 2,
            fail: false,
        };
        let result = unit_with_pages(source, 360, 2).discover(TimeWindow::new(4, 0, 100)).await;

        assert_eq!(result.outcome, DiscoveryOutcome::Complete);
        assert_eq!(result.observations.len(), 2);
    }
}
