//! Bitget Orders Backend Library
//!
//! Historical futures order extraction: time-windowed symbol discovery,
//! per-symbol paginated extraction, and a deduplicating merge into one
//! time-ordered result. Exposed for the binaries and integration tests.

pub mod api;
pub mod config;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod scrapers;
pub mod storage;

use std::path::Path;

/// Load `.env` from the working directory (and parents), then from the crate root.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
