//! Fetch Coordinator
//!
//! Guarantees single-flight fetching per key: the first request for a key
//! spawns one fetch task and registers its shared outcome; every concurrent
//! request for the same key awaits that outcome instead of calling its own
//! fetcher. Failed attempts are retried with exponential backoff, and the
//! successful value is written to the store when the task settles.

use std::collections::HashMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{validate_key, CacheStore, EntryOptions, EntryState};
use crate::error::{CacheError, Result, SharedError};
use crate::fetch::RetryPolicy;
use crate::lock;
use crate::scheduler::Scheduler;

/// Zero-argument operation that produces the value for one key.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wraps an async closure as a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Value produced by a settled fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Value,
    /// Retries consumed before the successful attempt
    pub retries: u32,
}

pub type FetchResult = Result<Fetched>;

type SharedOutcome = Shared<BoxFuture<'static, FetchResult>>;

/// Per-request fetch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchOptions {
    pub retry: RetryPolicy,
    /// Lifetime of the written entry, store defaults when `None`
    pub entry: Option<EntryOptions>,
}

struct InFlight {
    id: u64,
    outcome: SharedOutcome,
    waiters: Arc<watch::Sender<usize>>,
    attempts: watch::Receiver<u32>,
}

/// Keeps the waiter count of an in-flight fetch up to date.
struct WaiterGuard {
    waiters: Arc<watch::Sender<usize>>,
}

impl WaiterGuard {
    fn new(waiters: Arc<watch::Sender<usize>>) -> Self {
        waiters.send_modify(|count| *count += 1);
        Self { waiters }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiters
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

// == Pending Fetch ==
/// A caller's attachment to an in-flight fetch.
///
/// While held, the fetch keeps retrying. Once every attachment is dropped,
/// pending retries are abandoned; an attempt already running is never aborted.
pub struct PendingFetch {
    key: String,
    outcome: SharedOutcome,
    attempts: watch::Receiver<u32>,
    joined: bool,
    guard: Option<WaiterGuard>,
}

impl PendingFetch {
    fn attach(key: &str, flight: &InFlight, joined: bool) -> Self {
        Self {
            key: key.to_string(),
            outcome: flight.outcome.clone(),
            attempts: flight.attempts.clone(),
            joined,
            guard: Some(WaiterGuard::new(flight.waiters.clone())),
        }
    }

    fn failed(key: &str, error: CacheError) -> Self {
        let (_, attempts) = watch::channel(0);
        Self {
            key: key.to_string(),
            outcome: futures::future::ready(Err(error)).boxed().shared(),
            attempts,
            joined: false,
            guard: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true if this request attached to a fetch started earlier.
    pub fn joined(&self) -> bool {
        self.joined
    }

    /// Retry counter of the underlying fetch.
    pub fn attempts(&self) -> watch::Receiver<u32> {
        self.attempts.clone()
    }

    /// Waits for the shared outcome.
    pub async fn wait(self) -> FetchResult {
        let PendingFetch { outcome, guard, .. } = self;
        let result = outcome.await;
        drop(guard);
        result
    }
}

impl IntoFuture for PendingFetch {
    type Output = FetchResult;
    type IntoFuture = BoxFuture<'static, FetchResult>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

impl fmt::Debug for PendingFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFetch")
            .field("key", &self.key)
            .field("joined", &self.joined)
            .finish()
    }
}

// == Fetch Run ==
/// Everything one spawned fetch task needs.
struct FetchRun {
    key: String,
    fetcher: Fetcher,
    options: FetchOptions,
    store: Arc<Mutex<CacheStore>>,
    scheduler: Arc<dyn Scheduler>,
    waiters: Arc<watch::Sender<usize>>,
    attempts: watch::Sender<u32>,
    issued_seq: u64,
    monotonic_writes: bool,
}

impl FetchRun {
    async fn execute(self) -> FetchResult {
        let mut attempt: u32 = 0;
        loop {
            match (self.fetcher)().await {
                Ok(value) => {
                    let value = self.commit(value);
                    return Ok(Fetched {
                        value,
                        retries: attempt,
                    });
                }
                Err(err) => {
                    let cause: SharedError = Arc::new(err);
                    let policy = self.options.retry;

                    if !policy.allows_retry(attempt) {
                        warn!(key = %self.key, attempts = attempt + 1, error = %cause, "fetch failed");
                        return Err(if policy.max_retries == 0 {
                            CacheError::Fetch {
                                key: self.key,
                                cause,
                            }
                        } else {
                            CacheError::RetryExhausted {
                                key: self.key,
                                attempts: attempt + 1,
                                cause,
                            }
                        });
                    }

                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    self.attempts.send_replace(attempt);
                    debug!(key = %self.key, attempt, ?delay, error = %cause, "fetch attempt failed, retrying");

                    tokio::select! {
                        _ = self.scheduler.sleep(delay) => {}
                        _ = no_waiters(self.waiters.subscribe()) => {
                            debug!(key = %self.key, "no waiters left, abandoning retries");
                            return Err(CacheError::Cancelled { key: self.key });
                        }
                    }
                }
            }
        }
    }

    /// Writes in completion order, unless monotonic writes are on and a newer
    /// write landed after this fetch was issued. Returns the value now cached.
    fn commit(&self, value: Value) -> Value {
        let mut store = lock(&self.store);

        if self.monotonic_writes && store.entry_seq(&self.key) > self.issued_seq {
            debug!(key = %self.key, "fetch result superseded by a newer write, discarding");
            if let Some(entry) = store.peek(&self.key) {
                return entry.value.clone();
            }
        }

        if let Err(err) = store.set(self.key.clone(), value.clone(), self.options.entry) {
            warn!(key = %self.key, error = %err, "could not cache fetched value");
        }
        value
    }
}

async fn no_waiters(mut waiters: watch::Receiver<usize>) {
    let _ = waiters.wait_for(|count| *count == 0).await;
}

// == Fetch Coordinator ==
/// Single-flight registry and retry driver.
pub struct FetchCoordinator {
    store: Arc<Mutex<CacheStore>>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    scheduler: Arc<dyn Scheduler>,
    next_id: AtomicU64,
    issued: AtomicU64,
    monotonic_writes: bool,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<Mutex<CacheStore>>,
        scheduler: Arc<dyn Scheduler>,
        monotonic_writes: bool,
    ) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            next_id: AtomicU64::new(1),
            issued: AtomicU64::new(0),
            monotonic_writes,
        }
    }

    // == Fetch ==
    /// Attaches to the in-flight fetch for `key`, or starts one.
    ///
    /// The fetch runs in its own task, so it completes and writes to the
    /// store even if every caller goes away mid-attempt.
    pub fn fetch(&self, key: &str, fetcher: Fetcher, options: FetchOptions) -> PendingFetch {
        let mut registry = lock(&self.in_flight);

        if let Some(flight) = registry.get(key) {
            debug!(key, "joining in-flight fetch");
            return PendingFetch::attach(key, flight, true);
        }

        if let Err(err) = validate_key(key) {
            return PendingFetch::failed(key, err);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiters, _) = watch::channel(0usize);
        let waiters = Arc::new(waiters);
        let (attempts_tx, attempts_rx) = watch::channel(0u32);
        // Register the caller before the task can observe an empty waiter set.
        let guard = WaiterGuard::new(waiters.clone());

        let run = FetchRun {
            key: key.to_string(),
            fetcher,
            options,
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            waiters: waiters.clone(),
            attempts: attempts_tx,
            issued_seq: lock(&self.store).current_seq(),
            monotonic_writes: self.monotonic_writes,
        };

        let registry_ref = Arc::clone(&self.in_flight);
        let task_key = key.to_string();
        let task = tokio::spawn(async move {
            let result = run.execute().await;
            let mut registry = lock(&registry_ref);
            if registry.get(&task_key).is_some_and(|flight| flight.id == id) {
                registry.remove(&task_key);
            }
            result
        });

        let error_key = key.to_string();
        let outcome = async move {
            task.await.unwrap_or_else(|err| {
                Err(CacheError::Internal(format!(
                    "fetch task for '{error_key}' failed: {err}"
                )))
            })
        }
        .boxed()
        .shared();

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(key, "started fetch");

        let pending = PendingFetch {
            key: key.to_string(),
            outcome: outcome.clone(),
            attempts: attempts_rx.clone(),
            joined: false,
            guard: Some(guard),
        };
        registry.insert(
            key.to_string(),
            InFlight {
                id,
                outcome,
                waiters,
                attempts: attempts_rx,
            },
        );
        pending
    }

    // == Prefetch ==
    /// Best-effort background fetch.
    ///
    /// Skips keys that are fresh, joins an in-flight fetch rather than
    /// issuing a new one, and swallows failures.
    ///
    /// # Returns
    /// `true` if a new network operation was issued.
    pub fn prefetch(&self, key: &str, fetcher: Fetcher, options: FetchOptions) -> bool {
        if lock(&self.store).state(key) == Some(EntryState::Fresh) {
            debug!(key, "prefetch skipped, entry is fresh");
            return false;
        }

        let pending = self.fetch(key, fetcher, options);
        let issued = !pending.joined();
        tokio::spawn(async move {
            let key = pending.key().to_string();
            if let Err(err) = pending.wait().await {
                debug!(%key, error = %err, "prefetch failed");
            }
        });
        issued
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    /// Retries consumed so far by the in-flight fetch for `key`.
    pub fn attempt(&self, key: &str) -> Option<u32> {
        lock(&self.in_flight)
            .get(key)
            .map(|flight| *flight.attempts.borrow())
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Network operations started since creation.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Forgets every in-flight fetch. Running tasks still settle on their own.
    pub fn clear(&self) {
        lock(&self.in_flight).clear();
    }
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("in_flight", &self.in_flight_count())
            .field("issued", &self.issued_count())
            .field("monotonic_writes", &self.monotonic_writes)
            .finish()
    }
}
