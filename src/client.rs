//! Query Client
//!
//! The injectable cache service. One client owns a store, a fetch
//! coordinator, the host environment handle and any background tasks.
//! Cloning a client shares that instance; separate clients are isolated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::cache::{CacheEvent, CacheRead, CacheStats, CacheStore, EntryOptions, EntryState};
use crate::config::Config;
use crate::env::HostEnvironment;
use crate::error::Result;
use crate::fetch::{FetchCoordinator, FetchOptions, Fetched, Fetcher, PendingFetch, RetryPolicy};
use crate::lock;
use crate::mutation::{Mutation, MutationOptions};
use crate::query::{ListBinding, ListOptions, QueryBinding, QueryOptions};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::tasks::spawn_cleanup_task;

struct ClientInner {
    config: Config,
    store: Arc<Mutex<CacheStore>>,
    coordinator: FetchCoordinator,
    env: Arc<HostEnvironment>,
    scheduler: Arc<dyn Scheduler>,
    tasks: Mutex<Vec<AbortHandle>>,
    disposed: AtomicBool,
}

/// Handle to a cache instance.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    // == Constructor ==
    /// Creates a client driven by tokio timers.
    pub fn new(config: Config, env: Arc<HostEnvironment>) -> Self {
        Self::with_scheduler(config, env, Arc::new(TokioScheduler))
    }

    /// Creates a client whose backoff and delayed work go through `scheduler`.
    pub fn with_scheduler(
        config: Config,
        env: Arc<HostEnvironment>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let defaults = EntryOptions::new(config.default_ttl, config.default_stale_time);
        let store = Arc::new(Mutex::new(CacheStore::new(config.max_entries, defaults)));
        let coordinator =
            FetchCoordinator::new(store.clone(), scheduler.clone(), config.monotonic_writes);

        info!(
            max_entries = config.max_entries,
            ttl = ?config.default_ttl,
            stale_time = ?config.default_stale_time,
            max_retries = config.max_retries,
            "query client initialized"
        );

        Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                coordinator,
                env,
                scheduler,
                tasks: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn env(&self) -> &Arc<HostEnvironment> {
        &self.inner.env
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.inner.scheduler.clone()
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.inner.coordinator
    }

    /// Retry policy applied when a request does not override it.
    pub fn default_retry(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.inner.config)
    }

    pub fn default_entry_options(&self) -> EntryOptions {
        lock(&self.inner.store).defaults()
    }

    /// Fetch options built from the client defaults.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            retry: self.default_retry(),
            entry: None,
        }
    }

    // == Cache Operations ==
    /// Reads an entry, `None` on a miss.
    pub fn get(&self, key: &str) -> Option<CacheRead> {
        let read = lock(&self.inner.store).get(key);
        match &read {
            Some(hit) => debug!(key, state = ?hit.state, "cache read"),
            None => debug!(key, "cache miss"),
        }
        read
    }

    /// Reads a value without touching stats or access order.
    pub fn peek(&self, key: &str) -> Option<Value> {
        lock(&self.inner.store).peek(key).map(|entry| entry.value.clone())
    }

    /// Reads and decodes a value, ignoring freshness.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|hit| serde_json::from_value(hit.value).ok())
    }

    pub fn set(&self, key: &str, value: Value, options: Option<EntryOptions>) -> Result<()> {
        lock(&self.inner.store).set(key, value, options).map(|_| ())
    }

    pub fn has(&self, key: &str) -> bool {
        lock(&self.inner.store).has(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        lock(&self.inner.store).delete(key)
    }

    pub fn entry_state(&self, key: &str) -> Option<EntryState> {
        lock(&self.inner.store).state(key)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.inner.store).invalidate(key)
    }

    /// Marks every entry under `prefix` expired. Returns the count newly invalidated.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let count = lock(&self.inner.store).invalidate_prefix(prefix);
        debug!(prefix, count, "invalidated prefix");
        count
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        lock(&self.inner.store).keys_with_prefix(prefix)
    }

    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        lock(&self.inner.store).events()
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.inner.store).stats()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        lock(&self.inner.store).subscriber_count(key)
    }

    pub(crate) fn subscribe_key(&self, key: &str) {
        lock(&self.inner.store).subscribe(key);
    }

    pub(crate) fn unsubscribe_key(&self, key: &str) {
        lock(&self.inner.store).unsubscribe(key);
    }

    // == Fetching ==
    /// Single-flight fetch that always goes to the network (or joins one in flight).
    pub fn fetch(&self, key: &str, fetcher: Fetcher, options: FetchOptions) -> PendingFetch {
        self.inner.coordinator.fetch(key, fetcher, options)
    }

    /// Returns the cached value while fresh, otherwise fetches.
    pub async fn fetch_query(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: FetchOptions,
    ) -> Result<Fetched> {
        if let Some(hit) = self.get(key) {
            if hit.state == EntryState::Fresh {
                return Ok(Fetched {
                    value: hit.value,
                    retries: 0,
                });
            }
        }
        self.fetch(key, fetcher, options).await
    }

    /// Best-effort background fetch; see [`FetchCoordinator::prefetch`].
    pub fn prefetch(&self, key: &str, fetcher: Fetcher, options: FetchOptions) -> bool {
        self.inner.coordinator.prefetch(key, fetcher, options)
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.coordinator.is_fetching(key)
    }

    // == Factories ==
    /// Creates a data binding over one key.
    pub fn query<T>(&self, options: QueryOptions<T>) -> QueryBinding<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        QueryBinding::new(self.clone(), options)
    }

    /// Creates a paginated list binding.
    pub fn list<T>(&self, options: ListOptions<T>) -> ListBinding<T>
    where
        T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
    {
        ListBinding::new(self.clone(), options)
    }

    /// Creates a mutation executor.
    pub fn mutation<V, R>(&self, options: MutationOptions<V, R>) -> Mutation<V, R>
    where
        V: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        Mutation::new(self.clone(), options)
    }

    // == Lifecycle ==
    /// Starts the periodic removal of expired, unsubscribed entries.
    pub fn start_gc(&self) {
        let handle = spawn_cleanup_task(
            self.inner.store.clone(),
            self.scheduler(),
            self.inner.config.gc_interval,
        );
        self.track_task(handle.abort_handle());
    }

    /// Ties a background task to the client's lifetime.
    pub fn track_task(&self, handle: AbortHandle) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Cancels background tasks and drops all cached state.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<AbortHandle> = lock(&self.inner.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.inner.coordinator.clear();
        lock(&self.inner.store).clear();
        info!(tasks = tasks.len(), "query client disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &lock(&self.inner.store).len())
            .field("coordinator", &self.inner.coordinator)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
