//! Folds per-window observations into one frequency-ordered symbol list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{SymbolFrequency, SymbolObservation, UnifiedSymbolList};

/// Unique symbols ordered by occurrence count (desc), earliest first
/// sighting (asc), then name (asc). Independent of input order.
pub fn unify<I>(observations: I) -> UnifiedSymbolList
where
    I: IntoIterator<Item = SymbolObservation>,
{
    let mut tally: HashMap<String, (u32, i64)> = HashMap::new();
    for obs in observations {
        tally
            .entry(obs.symbol)
            .and_modify(|(count, first)| {
                *count += 1;
                *first = (*first).min(obs.first_seen);
            })
            .or_insert((1, obs.first_seen));
    }

    let mut frequencies: Vec<SymbolFrequency> = tally
        .into_iter()
        .map(|(symbol, (windows, first_seen))| SymbolFrequency {
            symbol,
            windows,
            first_seen,
        })
        .collect();

    frequencies.sort_by(|a, b| {
        b.windows
            .cmp(&a.windows)
            .then(a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    UnifiedSymbolList {
        symbols: frequencies.iter().map(|f| f.symbol.clone()).collect(),
        frequencies,
    }
}

/// Summary persisted next to a run for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub run_id: String,
    pub generated_at: i64,
    pub total_symbols: usize,
    pub windows_total: usize,
    pub windows_failed: Vec<u32>,
    pub windows_capped: Vec<u32>,
    pub windows_page_limited: Vec<u32>,
    pub most_frequent: Option<SymbolFrequency>,
    pub symbols_appearing_once: usize,
    pub symbols_appearing_multiple: usize,
    pub frequencies: Vec<SymbolFrequency>,
}

impl DiscoveryStats {
    pub fn from_unified(
        run_id: &str,
        generated_at: i64,
        unified: &UnifiedSymbolList,
        windows_total: usize,
        windows_failed: Vec<u32>,
        windows_capped: Vec<u32>,
        windows_page_limited: Vec<u32>,
    ) -> Self {
        let once = unified.frequencies.iter().filter(|f| f.windows == 1).count();
        Self {
            run_id: run_id.to_string(),
            generated_at,
            total_symbols: unified.len(),
            windows_total,
            windows_failed,
            windows_capped,
            windows_page_limited,
            most_frequent: unified.frequencies.first().cloned(),
            symbols_appearing_once: once,
            symbols_appearing_multiple: unified.len() - once,
            frequencies: unified.frequencies.clone(),
        }
    }
}
