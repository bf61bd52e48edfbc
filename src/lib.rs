//! Query Cache - an adaptive client-side data cache
//!
//! Key-addressed cache with staleness tracking, single-flight fetching with
//! retry/backoff, data and list bindings, mutations with cache updates, and
//! a network-aware, behavior-predicting prefetch manager.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod fetch;
pub mod mutation;
pub mod prefetch;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod tasks;
pub mod telemetry;

pub use cache::{query_key, CacheEvent, CacheStats, EntryOptions, EntryState};
pub use client::QueryClient;
pub use config::{Config, PrefetchConfig};
pub use env::{ConnectionType, HostEnvironment, HostEvent, NetworkStatus};
pub use error::{CacheError, Result};
pub use fetch::{fetcher, FetchOptions, Fetched, Fetcher, RetryPolicy};
pub use mutation::{mutation_fn, Mutation, MutationOptions, MutationState};
pub use prefetch::{PrefetchManager, PrefetchStats, PrefetchStrategy, Priority};
pub use query::{
    page_fetcher, ListBinding, ListOptions, ListState, Page, PageRequest, QueryBinding,
    QueryOptions, QueryState, QueryStatus,
};
pub use scheduler::{Scheduler, TaskHandle, TokioScheduler};
pub use storage::{KeyValueStorage, MemoryStorage};
pub use tasks::spawn_periodic_sync;

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
