pub mod bitget_rest; // Signed Bitget mix REST client
pub mod fetch_client; // Rate-limited retrying page fetches
pub mod rate_limit; // Per-worker token bucket

pub use bitget_rest::{BitgetCredentials, BitgetRestClient};
pub use fetch_client::{FetchError, OrderHistorySource, RateLimitedFetchClient, RetryPolicy};
pub use rate_limit::{TokenBucket, MIN_REQUESTS_PER_SECOND};
