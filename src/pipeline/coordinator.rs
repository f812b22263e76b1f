//! Sequences the pipeline stages.
//!
//! partition → discovery (fan-out) → unify → extraction (fan-out) → collect.
//! Each fan-out is a barrier: the next stage starts only once every unit of
//! the previous one has returned.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::config::{DiscoveryFailurePolicy, PipelineConfig};
use crate::models::{BlobRef, FailedSymbol, FailedWindow, FinalResult, RunMetadata, TimeWindow, UnifiedSymbolList};
use crate::pipeline::collector::ResultCollector;
use crate::pipeline::discovery::{DiscoveryOutcome, SymbolDiscoveryUnit, WindowDiscovery};
use crate::pipeline::extractor::{ExtractionStatus, SymbolExtraction, SymbolOrderExtractor};
use crate::pipeline::partition::{horizon_ending_at, partition, PartitionError};
use crate::pipeline::unifier::{unify, DiscoveryStats};
use crate::scrapers::{OrderHistorySource, RateLimitedFetchClient, RetryPolicy, TokenBucket};
use crate::storage::{discovery_stats_key, final_result_key, put_with_retry, BlobStore, BlobStoreError};

/// Run `unit` over every input with at most `max_concurrency` in flight.
///
/// Units run as separate tasks; a unit that panics shows up as an `Err`
/// for its input. Output order is completion order.
pub async fn run_parallel<X, Y, F, Fut>(
    inputs: Vec<X>,
    max_concurrency: usize,
    unit: F,
) -> Vec<(X, Result<Y, JoinError>)>
where
    X: Clone + Send + 'static,
    Y: Send + 'static,
    F: Fn(X) -> Fut,
    Fut: Future<Output = Y> + Send + 'static,
{
    stream::iter(inputs)
        .map(|input| {
            let handle = tokio::spawn(unit(input.clone()));
            async move { (input, handle.await) }
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await
}

/// Cooperative abort flag, checked between stages.
#[derive(Clone, Default)]
pub struct RunControl {
    aborted: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum PipelineError {
    Configuration(String),
    Aborted { stage: &'static str },
    DiscoveryFailed { windows: Vec<u32> },
    Storage(BlobStoreError),
    Serialization(serde_json::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Aborted { stage } => write!(f, "Run aborted before {} stage", stage),
            Self::DiscoveryFailed { windows } => {
                write!(f, "Symbol discovery failed for windows {:?}", windows)
            }
            Self::Storage(e) => write!(f, "Storage error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<PartitionError> for PipelineError {
    fn from(e: PartitionError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<BlobStoreError> for PipelineError {
    fn from(e: BlobStoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// `{timestamp}_{short uuid}`, safe as a blob key segment.
pub fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &id[..8])
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub run_id: String,
    /// Defaults to the configured lookback ending now.
    pub horizon: Option<TimeWindow>,
    /// Skip discovery and extract exactly these symbols.
    pub symbols: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub windows: Vec<WindowDiscovery>,
    pub unified: UnifiedSymbolList,
    pub failed: Vec<FailedWindow>,
    pub capped: Vec<u32>,
    /// Windows whose listing stopped at the page budget; symbols may be missing.
    pub page_limited: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    pub result_key: String,
    pub result: FinalResult,
}

pub struct PipelineCoordinator {
    config: PipelineConfig,
    client: Arc<RateLimitedFetchClient>,
    store: Arc<dyn BlobStore>,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig, source: Arc<dyn OrderHistorySource>, store: Arc<dyn BlobStore>) -> Self {
        let limiter = Arc::new(TokenBucket::from_config(&config.rate_limit));
        let retry = RetryPolicy::from_config(&config.retry);
        let client = Arc::new(RateLimitedFetchClient::new(source, limiter, retry));
        Self {
            config,
            client,
            store,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.store)
    }

    pub fn current_horizon(&self) -> Result<TimeWindow, PipelineError> {
        Ok(horizon_ending_at(
            Utc::now().timestamp_millis(),
            self.config.horizon.lookback_ms(),
        )?)
    }

    pub fn windows(&self, horizon: &TimeWindow) -> Result<Vec<TimeWindow>, PipelineError> {
        Ok(partition(horizon.start, horizon.end, self.config.horizon.window_ms())?)
    }

    /// Discovery fan-out over every window of `horizon`, then unification.
    pub async fn discover_symbols(&self, horizon: &TimeWindow) -> Result<DiscoveryReport, PipelineError> {
        let windows = self.windows(horizon)?;
        info!(windows = windows.len(), "🔍 Starting symbol discovery");

        let unit = Arc::new(SymbolDiscoveryUnit::new(Arc::clone(&self.client), &self.config.discovery));
        let outputs = run_parallel(windows, self.config.discovery.concurrency, move |window| {
            let unit = Arc::clone(&unit);
            async move { unit.discover(window).await }
        })
        .await;

        let mut results: Vec<WindowDiscovery> = outputs
            .into_iter()
            .map(|(window, output)| {
                output.unwrap_or_else(|e| WindowDiscovery::failed(window, format!("unit panicked: {}", e), 0))
            })
            .collect();
        results.sort_by_key(|r| r.window.id);

        let mut failed = Vec::new();
        let mut capped = Vec::new();
        let mut page_limited = Vec::new();
        for r in &results {
            match &r.outcome {
                DiscoveryOutcome::Failed { error } => failed.push(FailedWindow {
                    window: r.window,
                    error: error.clone(),
                }),
                DiscoveryOutcome::Capped => capped.push(r.window.id),
                DiscoveryOutcome::PageLimited => page_limited.push(r.window.id),
                DiscoveryOutcome::Complete => {}
            }
        }

        if !failed.is_empty() {
            warn!(failed = failed.len(), "Some discovery windows failed");
            if self.config.discovery.failure_policy == DiscoveryFailurePolicy::FailFast {
                return Err(PipelineError::DiscoveryFailed {
                    windows: failed.iter().map(|f| f.window.id).collect(),
                });
            }
        }

        let unified = unify(results.iter().flat_map(|r| r.observations.iter().cloned()));
        info!(
            symbols = unified.len(),
            failed_windows = failed.len(),
            capped_windows = capped.len(),
            page_limited_windows = page_limited.len(),
            "Symbol discovery unified"
        );

        Ok(DiscoveryReport {
            windows: results,
            unified,
            failed,
            capped,
            page_limited,
        })
    }

    /// Extraction fan-out, one unit per symbol.
    pub async fn extract_symbols(
        &self,
        run_id: &str,
        horizon: &TimeWindow,
        symbols: Vec<String>,
    ) -> Vec<SymbolExtraction> {
        info!(run_id = %run_id, symbols = symbols.len(), "📦 Starting order extraction");

        let extractor = Arc::new(SymbolOrderExtractor::new(
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            *horizon,
            &self.config.extraction,
        ));
        let run_id = run_id.to_string();
        let outputs = run_parallel(symbols, self.config.extraction.concurrency, move |symbol| {
            let extractor = Arc::clone(&extractor);
            let run_id = run_id.clone();
            async move { extractor.extract(&run_id, &symbol).await }
        })
        .await;

        outputs
            .into_iter()
            .map(|(symbol, output)| {
                output.unwrap_or_else(|e| SymbolExtraction {
                    symbol,
                    blob: None,
                    orders: 0,
                    pages_fetched: 0,
                    status: ExtractionStatus::Failed {
                        reason: format!("unit panicked: {}", e),
                    },
                })
            })
            .collect()
    }

    /// Collect the given blobs, or every blob of the run when `refs` is `None`.
    pub async fn collect_run(&self, run_id: &str, refs: Option<Vec<BlobRef>>) -> Result<FinalResult, PipelineError> {
        let collector = ResultCollector::new(Arc::clone(&self.store), self.config.extraction.collect_concurrency);
        let refs = match refs {
            Some(refs) => refs,
            None => collector.refs_for_run(run_id).await?,
        };
        let mut result = collector.collect(&refs).await;
        result.run.run_id = run_id.to_string();
        Ok(result)
    }

    pub async fn persist_result(&self, run_id: &str, result: &FinalResult) -> Result<String, PipelineError> {
        let key = final_result_key(run_id);
        let bytes = serde_json::to_vec(result)?;
        put_with_retry(self.store.as_ref(), &key, bytes).await?;
        info!(key = %key, orders = result.total_orders, "💾 Final result stored");
        Ok(key)
    }

    pub async fn run(&self, request: RunRequest, control: &RunControl) -> Result<PipelineRun, PipelineError> {
        let run_id = request.run_id.clone();
        let started_at = Utc::now().timestamp_millis();

        check_abort(control, "partition")?;
        let horizon = match request.horizon {
            Some(h) => h,
            None => self.current_horizon()?,
        };
        let windows_total = self.windows(&horizon)?.len();
        info!(
            run_id = %run_id,
            start = %horizon.start_iso(),
            end = %horizon.end_iso(),
            windows = windows_total,
            "🚀 Pipeline run starting"
        );

        let (symbols, windows_failed, windows_capped, windows_page_limited) = match request.symbols {
            Some(symbols) => (dedup_preserving_order(symbols), Vec::new(), Vec::new(), Vec::new()),
            None => {
                check_abort(control, "discovery")?;
                let report = self.discover_symbols(&horizon).await?;
                self.store_discovery_stats(&run_id, &report, windows_total).await;
                (report.unified.symbols, report.failed, report.capped, report.page_limited)
            }
        };

        check_abort(control, "extraction")?;
        let symbols_requested = symbols.len();
        let extractions = self.extract_symbols(&run_id, &horizon, symbols).await;

        let mut refs = Vec::new();
        let mut symbols_failed = Vec::new();
        for extraction in extractions {
            if let ExtractionStatus::Failed { reason } = &extraction.status {
                symbols_failed.push(FailedSymbol {
                    symbol: extraction.symbol.clone(),
                    error: reason.clone(),
                });
            }
            if let Some(blob) = extraction.blob {
                refs.push(blob);
            }
        }
        symbols_failed.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        if !symbols_failed.is_empty() {
            warn!(run_id = %run_id, failed = symbols_failed.len(), "Some symbols could not be extracted");
        }

        check_abort(control, "collection")?;
        let mut result = self.collect_run(&run_id, Some(refs.clone())).await?;

        let complete = windows_failed.is_empty()
            && windows_page_limited.is_empty()
            && symbols_failed.is_empty()
            && result.symbols_incomplete.is_empty()
            && result.unreadable_blobs.is_empty();
        result.message = format!(
            "Extracted {} orders from {} symbols{}",
            result.total_orders,
            result.symbols_processed,
            if complete { "" } else { " (partial)" }
        );
        result.run = RunMetadata {
            run_id: run_id.clone(),
            started_at: Some(started_at),
            finished_at: Some(Utc::now().timestamp_millis()),
            horizon: Some(horizon),
            windows_total,
            windows_failed,
            windows_capped,
            windows_page_limited,
            symbols_requested,
            symbols_failed,
            complete,
        };

        let result_key = self.persist_result(&run_id, &result).await?;

        if self.config.storage.delete_intermediates {
            for blob in &refs {
                if let Err(e) = self.store.delete(&blob.key).await {
                    warn!(key = %blob.key, "Failed to delete intermediate blob: {}", e);
                }
            }
        }

        info!(
            run_id = %run_id,
            total_orders = result.total_orders,
            symbols_processed = result.symbols_processed,
            complete,
            "✅ Pipeline run finished"
        );

        Ok(PipelineRun {
            run_id,
            result_key,
            result,
        })
    }

    async fn store_discovery_stats(&self, run_id: &str, report: &DiscoveryReport, windows_total: usize) {
        let stats = DiscoveryStats::from_unified(
            run_id,
            Utc::now().timestamp_millis(),
            &report.unified,
            windows_total,
            report.failed.iter().map(|f| f.window.id).collect(),
            report.capped.clone(),
            report.page_limited.clone(),
        );
        let key = discovery_stats_key(run_id);
        let stored = match serde_json::to_vec_pretty(&stats) {
            Ok(bytes) => put_with_retry(self.store.as_ref(), &key, bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = stored {
            error!(key = %key, "Failed to store discovery stats: {}", e);
        }
    }
}

fn check_abort(control: &RunControl, stage: &'static str) -> Result<(), PipelineError> {
    if control.is_aborted() {
        warn!(stage, "Run aborted");
        return Err(PipelineError::Aborted { stage });
    }
    Ok(())
}

fn dedup_preserving_order(symbols: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    symbols
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_parallel_respects_concurrency_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outputs = run_parallel((0..20).collect::<Vec<u32>>(), 4, {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |x| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    x * 2
                }
            }
        })
        .await;

        assert_eq!(outputs.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        for (x, y) in outputs {
            assert_eq!(y.unwrap(), x * 2);
        }
    }

    #[tokio::test]
    async fn test_run_parallel_isolates_panics() {
        let outputs = run_parallel(vec![1u32, 2, 3], 2, |x| async move {
            if x == 2 {
                panic!("unit blew up");
            }
            x
        })
        .await;

        let mut ok: Vec<u32> = outputs.iter().filter_map(|(_, r)| r.as_ref().ok().copied()).collect();
        ok.sort();
        assert_eq!(ok, vec![1, 3]);
        assert!(outputs.iter().any(|(x, r)| *x == 2 && r.is_err()));
    }

    #[test]
    fn test_run_control() {
        let control = RunControl::new();
        let shared = control.clone();
        assert!(check_abort(&control, "discovery").is_ok());
        shared.abort();
        assert!(matches!(
            check_abort(&control, "discovery"),
            Err(PipelineError::Aborted { stage: "discovery" })
        ));
    }

    #[test]
    fn test_run_ids_are_key_safe() {
        let id = new_run_id();
        assert_eq!(crate::storage::encode_segment(&id), id);
        assert_ne!(new_run_id(), id);
    }

    #[test]
    fn test_dedup_preserving_order() {
        let symbols = vec!["B".to_string(), " A ".to_string(), "B".to_string(), "".to_string()];
        assert_eq!(dedup_preserving_order(symbols), vec!["B", "A"]);
    }
}
