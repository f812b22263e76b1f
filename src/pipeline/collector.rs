//! Merges per-symbol blobs into one deduplicated, time-ordered result.

use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::analytics::analyze;
use crate::models::{BlobRef, DateRange, FinalResult, Order, SymbolResultBlob, UnreadableBlob};
use crate::storage::{symbol_results_prefix, BlobStore, BlobStoreError};

pub struct ResultCollector {
    store: Arc<dyn BlobStore>,
    read_concurrency: usize,
}

impl ResultCollector {
    pub fn new(store: Arc<dyn BlobStore>, read_concurrency: usize) -> Self {
        Self {
            store,
            read_concurrency: read_concurrency.max(1),
        }
    }

    /// Every symbol blob written under `run_id`.
    pub async fn refs_for_run(&self, run_id: &str) -> Result<Vec<BlobRef>, BlobStoreError> {
        let keys = self.store.list_by_prefix(&symbol_results_prefix(run_id)).await?;
        Ok(keys.into_iter().map(BlobRef::new).collect())
    }

    pub async fn collect(&self, refs: &[BlobRef]) -> FinalResult {
        let mut refs: Vec<BlobRef> = refs.to_vec();
        refs.sort();
        refs.dedup();

        // Reads complete in any order; merging happens in key order.
        let mut reads: Vec<(BlobRef, Result<SymbolResultBlob, String>)> = stream::iter(refs)
            .map(|blob_ref| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = read_blob(store.as_ref(), &blob_ref.key).await;
                    (blob_ref, result)
                }
            })
            .buffer_unordered(self.read_concurrency)
            .collect()
            .await;
        reads.sort_by(|a, b| a.0.cmp(&b.0));

        let mut seen: HashSet<String> = HashSet::new();
        let mut orders: Vec<Order> = Vec::new();
        let mut duplicates_removed = 0usize;
        let mut symbols_processed = 0usize;
        let mut symbols_incomplete: Vec<String> = Vec::new();
        let mut unreadable_blobs: Vec<UnreadableBlob> = Vec::new();

        for (blob_ref, read) in reads {
            let blob = match read {
                Ok(blob) => blob,
                Err(error) => {
                    warn!(key = %blob_ref.key, "Excluding unreadable symbol blob: {}", error);
                    unreadable_blobs.push(UnreadableBlob {
                        key: blob_ref.key,
                        error,
                    });
                    continue;
                }
            };

            if blob.complete {
                symbols_processed += 1;
            } else {
                symbols_incomplete.push(blob.symbol.clone());
            }

            for order in blob.orders {
                if seen.insert(order.order_id.clone()) {
                    orders.push(order);
                } else {
                    duplicates_removed += 1;
                }
            }
        }

        sort_orders(&mut orders);

        let mut orders_by_symbol: BTreeMap<String, usize> = BTreeMap::new();
        for order in &orders {
            *orders_by_symbol.entry(order.symbol.clone()).or_default() += 1;
        }

        let earliest = orders.last().map(|o| o.create_time);
        let latest = orders.first().map(|o| o.create_time);

        info!(
            total_orders = orders.len(),
            symbols_processed,
            incomplete = symbols_incomplete.len(),
            unreadable = unreadable_blobs.len(),
            duplicates_removed,
            "Collected symbol results"
        );

        FinalResult {
            message: format!(
                "Collected {} orders from {} symbols",
                orders.len(),
                symbols_processed + symbols_incomplete.len()
            ),
            total_orders: orders.len(),
            symbols_processed,
            symbols_incomplete,
            unreadable_blobs,
            duplicates_removed,
            date_range: DateRange::from_bounds(earliest, latest),
            orders_by_symbol,
            run: Default::default(),
            analytics: analyze(&orders),
            orders,
        }
    }
}

/// Newest first; equal timestamps ordered by order id.
pub fn sort_orders(orders: &mut [Order]) {
    orders.sort_by(|a, b| {
        b.create_time
            .cmp(&a.create_time)
            .then_with(|| a.order_id.cmp(&b.order_id))
    });
}

async fn read_blob(store: &dyn BlobStore, key: &str) -> Result<SymbolResultBlob, String> {
    let bytes = store
        .get(key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "blob not found".to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| format!("malformed blob: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductType, Side};
    use crate::storage::{symbol_result_key, MemoryBlobStore};
    use rust_decimal::Decimal;

    fn order(id: &str, symbol: &str, ts: i64) -> Order {
        Order {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Sell,
            size: Decimal::ONE,
            price: Decimal::from(10),
            create_time: ts,
            product_type: ProductType::Umcbl,
        }
    }

    async fn write_blob(store: &MemoryBlobStore, symbol: &str, complete: bool, orders: Vec<Order>) -> BlobRef {
        let blob = SymbolResultBlob {
            run_id: "r1".to_string(),
            symbol: symbol.to_string(),
            complete,
            error: None,
            pages_fetched: 1,
            duplicates_skipped: 0,
            filtered_out: 0,
            extracted_at: 0,
            orders,
        };
        let key = symbol_result_key("r1", symbol);
        store.put(&key, serde_json::to_vec(&blob).unwrap()).await.unwrap();
        BlobRef::new(key)
    }

    #[tokio::test]
    async fn test_global_dedup_and_descending_sort() {
        let store = Arc::new(MemoryBlobStore::new());
        let a = write_blob(&store, "AAA", true, vec![order("X1", "AAA", 100), order("X2", "AAA", 300)]).await;
        let b = write_blob(&store, "BBB", true, vec![order("X1", "BBB", 100), order("X3", "BBB", 200)]).await;

        let result = ResultCollector::new(store, 4).collect(&[b, a]).await;

        let ids: Vec<&str> = result.orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["X2", "X3", "X1"]);
        let times: Vec<i64> = result.orders.iter().map(|o| o.create_time).collect();
        assert_eq!(times, vec![300, 200, 100]);
        assert_eq!(result.total_orders, 3);
        assert_eq!(result.duplicates_removed, 1);
        assert_eq!(result.symbols_processed, 2);
        // Key order decides which copy of a duplicate survives.
        assert_eq!(result.orders[2].symbol, "AAA");
        assert_eq!(result.date_range.earliest_timestamp, Some(100));
        assert_eq!(result.date_range.latest_timestamp, Some(300));
    }

    #[tokio::test]
    async fn test_equal_timestamps_order_by_id() {
        let store = Arc::new(MemoryBlobStore::new());
        let a = write_blob(&store, "A", true, vec![order("b", "A", 5), order("a", "A", 5), order("c", "A", 9)]).await;

        let result = ResultCollector::new(store, 1).collect(&[a]).await;
        let ids: Vec<&str> = result.orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_unreadable_and_incomplete_blobs() {
        let store = Arc::new(MemoryBlobStore::new());
        let good = write_blob(&store, "GOOD", true, vec![order("1", "GOOD", 10)]).await;
        let partial = write_blob(&store, "PART", false, vec![order("2", "PART", 20)]).await;
        store.put("symbol_results/r1/BAD.json", b"not json".to_vec()).await.unwrap();
        let bad = BlobRef::new("symbol_results/r1/BAD.json");
        let missing = BlobRef::new("symbol_results/r1/GONE.json");

        let result = ResultCollector::new(store, 4)
            .collect(&[good, partial, bad, missing])
            .await;

        assert_eq!(result.symbols_processed, 1);
        assert_eq!(result.symbols_incomplete, vec!["PART"]);
        assert_eq!(result.unreadable_blobs.len(), 2);
        assert_eq!(result.total_orders, 2);
        assert_eq!(result.orders_by_symbol.get("PART"), Some(&1));
    }

    #[tokio::test]
    async fn test_analytics_cover_deduplicated_orders() {
        let store = Arc::new(MemoryBlobStore::new());
        let a = write_blob(&store, "AAA", true, vec![order("X1", "AAA", 100), order("X2", "AAA", 300)]).await;
        let b = write_blob(&store, "BBB", true, vec![order("X1", "BBB", 100)]).await;

        let result = ResultCollector::new(store, 2).collect(&[a, b]).await;

        assert_eq!(result.analytics.general.total_orders, result.total_orders);
        assert_eq!(result.analytics.general.total_notional, Decimal::from(20));
        assert_eq!(result.analytics.symbols["AAA"].orders, 2);
        assert!(!result.analytics.symbols.contains_key("BBB"));
        assert_eq!(result.analytics.top_symbols_by_notional[0].symbol, "AAA");
    }

    #[tokio::test]
    async fn test_refs_for_run_lists_only_that_run() {
        let store = Arc::new(MemoryBlobStore::new());
        write_blob(&store, "A", true, vec![]).await;
        store.put("symbol_results/r2/B.json", b"{}".to_vec()).await.unwrap();

        let refs = ResultCollector::new(store, 1).refs_for_run("r1").await.unwrap();
        assert_eq!(refs, vec![BlobRef::new("symbol_results/r1/A.json")]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let store = Arc::new(MemoryBlobStore::new());
        let result = ResultCollector::new(store, 1).collect(&[]).await;
        assert_eq!(result.total_orders, 0);
        assert_eq!(result.date_range.total_days, 0.0);
    }
}
