pub mod executions;
pub mod routes;

pub use executions::{ExecutionRecord, ExecutionRegistry, ExecutionState};
pub use routes::{create_router, AppState};
