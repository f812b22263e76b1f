//! The extraction pipeline stages.

pub mod analytics;
pub mod collector;
pub mod coordinator;
pub mod discovery;
pub mod extractor;
pub mod partition;
pub mod unifier;

pub use analytics::{analyze, OrderAnalytics};
pub use collector::ResultCollector;
pub use coordinator::{
    new_run_id, run_parallel, DiscoveryReport, PipelineCoordinator, PipelineError, PipelineRun,
    RunControl, RunRequest,
};
pub use discovery::{DiscoveryOutcome, SymbolDiscoveryUnit, WindowDiscovery};
pub use extractor::{ExtractionStatus, SymbolExtraction, SymbolOrderExtractor};
pub use partition::{horizon_ending_at, partition, PartitionError};
pub use unifier::{unify, DiscoveryStats};
