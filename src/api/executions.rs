//! In-memory registry of background pipeline runs.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

use crate::models::ResultSummary;
use crate::pipeline::{PipelineError, PipelineRun, RunControl};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Succeeded {
        result_key: String,
        summary: ResultSummary,
    },
    Failed {
        error: String,
    },
    Aborted {
        stage: String,
    },
}

#[derive(Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub requested_symbols: Option<Vec<String>>,
    pub abort_requested: bool,
    #[serde(flatten)]
    pub state: ExecutionState,
    #[serde(skip)]
    control: RunControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Requested,
    AlreadyFinished,
    NotFound,
}

/// Finished records kept before the oldest are dropped.
pub const MAX_FINISHED_RECORDS: usize = 256;

pub struct ExecutionRegistry {
    runs: RwLock<HashMap<String, ExecutionRecord>>,
    max_finished: usize,
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::with_retention(MAX_FINISHED_RECORDS)
    }
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_finished` finished records. Running ones are never dropped.
    pub fn with_retention(max_finished: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            max_finished,
        }
    }

    /// Track a new run and hand back its abort handle.
    pub fn register(&self, execution_id: &str, requested_symbols: Option<Vec<String>>) -> RunControl {
        let control = RunControl::new();
        let record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            started_at: Utc::now().timestamp_millis(),
            finished_at: None,
            requested_symbols,
            abort_requested: false,
            state: ExecutionState::Running,
            control: control.clone(),
        };
        self.runs.write().insert(execution_id.to_string(), record);
        control
    }

    pub fn finish(&self, execution_id: &str, outcome: &Result<PipelineRun, PipelineError>) {
        let state = match outcome {
            Ok(run) => ExecutionState::Succeeded {
                result_key: run.result_key.clone(),
                summary: run.result.summary(),
            },
            Err(PipelineError::Aborted { stage }) => ExecutionState::Aborted {
                stage: stage.to_string(),
            },
            Err(e) => ExecutionState::Failed { error: e.to_string() },
        };

        let mut runs = self.runs.write();
        if let Some(record) = runs.get_mut(execution_id) {
            record.state = state;
            record.finished_at = Some(Utc::now().timestamp_millis());
        }
        prune_finished(&mut runs, self.max_finished);
    }

    /// Most recently started first.
    pub fn list(&self, limit: usize) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self.runs.read().values().cloned().collect();
        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.execution_id.cmp(&a.execution_id))
        });
        records.truncate(limit);
        records
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.runs.read().get(execution_id).cloned()
    }

    pub fn abort(&self, execution_id: &str) -> AbortOutcome {
        let mut runs = self.runs.write();
        match runs.get_mut(execution_id) {
            None => AbortOutcome::NotFound,
            Some(record) if record.state != ExecutionState::Running => AbortOutcome::AlreadyFinished,
            Some(record) => {
                record.control.abort();
                record.abort_requested = true;
                AbortOutcome::Requested
            }
        }
    }
}

fn prune_finished(runs: &mut HashMap<String, ExecutionRecord>, max_finished: usize) {
    let mut finished: Vec<(i64, String)> = runs
        .values()
        .filter_map(|r| r.finished_at.map(|t| (t, r.execution_id.clone())))
        .collect();
    if finished.len() <= max_finished {
        return;
    }
    finished.sort();
    let excess = finished.len() - max_finished;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}
