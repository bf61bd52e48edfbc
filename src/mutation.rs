//! Mutation Executor
//!
//! Runs side-effecting operations and applies their cache consequences.
//! Unlike fetches, overlapping `mutate` calls are never deduplicated: each
//! call runs the mutation function once, and the last call to settle decides
//! the reported data or error.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::client::QueryClient;
use crate::error::{CacheError, Result};
use crate::lock;

pub type MutationFn<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;
pub type SuccessCallback<V, R> = Arc<dyn Fn(&R, &V) + Send + Sync>;
pub type ErrorCallback<V> = Arc<dyn Fn(&CacheError, &V) + Send + Sync>;
pub type SettledCallback<V, R> = Arc<dyn Fn(Option<&R>, Option<&CacheError>, &V) + Send + Sync>;
/// Writes a mutation result straight into the cache.
pub type CacheUpdater<V, R> = Arc<dyn Fn(&QueryClient, &R, &V) + Send + Sync>;

/// Wraps an async closure as a [`MutationFn`].
pub fn mutation_fn<V, R, F, Fut>(f: F) -> MutationFn<V, R>
where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(move |variables| f(variables).boxed())
}

// == Mutation Options ==
pub struct MutationOptions<V, R> {
    mutation_fn: MutationFn<V, R>,
    on_success: Option<SuccessCallback<V, R>>,
    on_error: Option<ErrorCallback<V>>,
    on_settled: Option<SettledCallback<V, R>>,
    invalidate_queries: Vec<String>,
    update_cache: Option<CacheUpdater<V, R>>,
}

impl<V, R> MutationOptions<V, R> {
    pub fn new(mutation_fn: MutationFn<V, R>) -> Self {
        Self {
            mutation_fn,
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidate_queries: Vec::new(),
            update_cache: None,
        }
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&R, &V) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CacheError, &V) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&R>, Option<&CacheError>, &V) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(callback));
        self
    }

    /// Key prefixes expired after every successful run.
    pub fn invalidate_queries<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_queries = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn update_cache<F>(mut self, updater: F) -> Self
    where
        F: Fn(&QueryClient, &R, &V) + Send + Sync + 'static,
    {
        self.update_cache = Some(Arc::new(updater));
        self
    }
}

// == Mutation State ==
#[derive(Debug, Clone)]
pub struct MutationState<R> {
    pub data: Option<R>,
    pub error: Option<CacheError>,
    pub is_loading: bool,
}

#[derive(Debug)]
struct MutationRun<R> {
    data: Option<R>,
    error: Option<CacheError>,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// == Mutation ==
pub struct Mutation<V, R> {
    client: QueryClient,
    options: MutationOptions<V, R>,
    run: Mutex<MutationRun<R>>,
    in_flight: AtomicUsize,
}

impl<V, R> Mutation<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(client: QueryClient, options: MutationOptions<V, R>) -> Self {
        Self {
            client,
            options,
            run: Mutex::new(MutationRun {
                data: None,
                error: None,
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    // == Mutate ==
    /// Runs the mutation function once with `variables`.
    ///
    /// On success the cache is updated (updater, then prefix invalidation),
    /// then `on_success` and `on_settled` run. On failure `on_error` and
    /// `on_settled` run and the error is returned.
    pub async fn mutate(&self, variables: V) -> Result<R> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        {
            let mut run = lock(&self.run);
            run.data = None;
            run.error = None;
        }

        match (self.options.mutation_fn)(variables.clone()).await {
            Ok(result) => {
                if let Some(update) = &self.options.update_cache {
                    update(&self.client, &result, &variables);
                }
                for prefix in &self.options.invalidate_queries {
                    self.client.invalidate_prefix(prefix);
                }
                debug!(
                    invalidated = self.options.invalidate_queries.len(),
                    "mutation succeeded"
                );

                if let Some(on_success) = &self.options.on_success {
                    on_success(&result, &variables);
                }
                if let Some(on_settled) = &self.options.on_settled {
                    on_settled(Some(&result), None, &variables);
                }

                let mut run = lock(&self.run);
                run.data = Some(result.clone());
                run.error = None;
                Ok(result)
            }
            Err(err) => {
                let err = CacheError::Mutation {
                    cause: Arc::new(err),
                };
                warn!(error = %err, "mutation failed");

                if let Some(on_error) = &self.options.on_error {
                    on_error(&err, &variables);
                }
                if let Some(on_settled) = &self.options.on_settled {
                    on_settled(None, Some(&err), &variables);
                }

                let mut run = lock(&self.run);
                run.data = None;
                run.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Clears data and error. Runs still in flight are left alone.
    pub fn reset(&self) {
        let mut run = lock(&self.run);
        run.data = None;
        run.error = None;
    }

    pub fn state(&self) -> MutationState<R> {
        let run = lock(&self.run);
        MutationState {
            data: run.data.clone(),
            error: run.error.clone(),
            is_loading: self.is_loading(),
        }
    }

    pub fn data(&self) -> Option<R> {
        lock(&self.run).data.clone()
    }

    pub fn error(&self) -> Option<CacheError> {
        lock(&self.run).error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio_test::{assert_err, assert_ok};

    use crate::cache::EntryState;
    use crate::config::Config;
    use crate::env::HostEnvironment;

    fn client() -> QueryClient {
        QueryClient::new(Config::default(), Arc::new(HostEnvironment::new()))
    }

    #[tokio::test]
    async fn test_callbacks_run_in_order_on_success() {
        let client = client();
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();
        let (success_log, settled_log) = (calls.clone(), calls.clone());

        let mutation = client.mutation(
            MutationOptions::new(mutation_fn(|n: u32| async move { Ok(n * 2) }))
                .on_success(move |result, vars| {
                    lock(&success_log).push(format!("success {result} {vars}"));
                })
                .on_settled(move |result, error, _| {
                    lock(&settled_log).push(format!("settled {:?} {}", result, error.is_some()));
                }),
        );

        assert_eq!(assert_ok!(mutation.mutate(21).await), 42);
        assert_eq!(
            *lock(&calls),
            vec!["success 42 21".to_string(), "settled Some(42) false".to_string()]
        );
        assert_eq!(mutation.data(), Some(42));
        assert!(!mutation.is_loading());
    }

    #[tokio::test]
    async fn test_failure_runs_callbacks_then_rethrows() {
        let client = client();
        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let (error_log, settled_log) = (calls.clone(), calls.clone());

        let mutation = client.mutation(
            MutationOptions::new(mutation_fn(|_: ()| async {
                Err::<u32, _>(anyhow::anyhow!("rejected"))
            }))
            .on_error(move |_, _| lock(&error_log).push("error"))
            .on_settled(move |result, error, _| {
                assert!(result.is_none() && error.is_some());
                lock(&settled_log).push("settled");
            }),
        );

        let err = assert_err!(mutation.mutate(()).await);
        assert!(matches!(err, CacheError::Mutation { .. }));
        assert_eq!(*lock(&calls), vec!["error", "settled"]);
        assert!(mutation.error().is_some());

        mutation.reset();
        assert!(mutation.error().is_none());
    }

    #[tokio::test]
    async fn test_update_cache_writes_directly() {
        let client = client();
        let mutation = client.mutation(
            MutationOptions::new(mutation_fn(|name: String| async move {
                Ok(json!({"id": 7, "name": name}))
            }))
            .update_cache(|client, result: &Value, _| {
                client.set("user:7", result.clone(), None).unwrap();
            }),
        );

        assert_ok!(mutation.mutate("Grace".to_string()).await);
        assert_eq!(client.get("user:7").unwrap().value["name"], "Grace");
        assert_eq!(client.entry_state("user:7"), Some(EntryState::Fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_does_not_cancel_in_flight_run() {
        let client = client();
        let mutation = Arc::new(client.mutation(MutationOptions::new(mutation_fn(
            |n: u32| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(n)
            },
        ))));

        let running = {
            let mutation = mutation.clone();
            tokio::spawn(async move { mutation.mutate(5).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(mutation.is_loading());

        mutation.reset();
        assert_eq!(assert_ok!(running.await.unwrap()), 5);
        assert_eq!(mutation.data(), Some(5));
        assert!(!mutation.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_are_not_deduplicated() {
        let client = client();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mutation = client.mutation(MutationOptions::new(mutation_fn(move |delay: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay)
            }
        })));

        let (slow, fast) = tokio::join!(mutation.mutate(100), mutation.mutate(10));

        assert_eq!((assert_ok!(slow), assert_ok!(fast)), (100, 10));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // The slower run settled last.
        assert_eq!(mutation.data(), Some(100));
    }
}
