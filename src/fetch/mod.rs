//! Fetch Module
//!
//! Single-flight fetching with bounded exponential backoff.

mod coordinator;
mod retry;

pub use coordinator::{
    fetcher, FetchCoordinator, FetchOptions, FetchResult, Fetched, Fetcher, PendingFetch,
};
pub use retry::RetryPolicy;
