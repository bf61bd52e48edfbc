//! Data Binding
//!
//! A per-consumer view over one cache key. The binding fetches on mount,
//! serves stale data while revalidating, reacts to cache events and host
//! focus/reconnect signals, and exposes its state as a [`QueryState`]
//! snapshot decoded on every read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheEvent, EntryOptions, EntryState};
use crate::client::QueryClient;
use crate::env::HostEvent;
use crate::error::{CacheError, Result};
use crate::fetch::{FetchOptions, FetchResult, Fetcher, PendingFetch};
use crate::lock;

/// Pure transform from the raw cached value to the consumer's type.
pub type Selector<T> = Arc<dyn Fn(&Value) -> anyhow::Result<T> + Send + Sync>;

// == Query Options ==
/// Configuration for one data binding.
pub struct QueryOptions<T> {
    pub(crate) key: String,
    pub(crate) fetcher: Fetcher,
    pub(crate) enabled: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) retry: Option<u32>,
    pub(crate) retry_delay: Option<Duration>,
    pub(crate) select: Option<Selector<T>>,
    pub(crate) placeholder_data: Option<T>,
    pub(crate) keep_previous_data: bool,
    pub(crate) refetch_on_focus: bool,
    pub(crate) refetch_on_reconnect: bool,
}

impl<T> QueryOptions<T> {
    pub fn new(key: impl Into<String>, fetcher: Fetcher) -> Self {
        Self {
            key: key.into(),
            fetcher,
            enabled: true,
            ttl: None,
            stale_time: None,
            retry: None,
            retry_delay: None,
            select: None,
            placeholder_data: None,
            keep_previous_data: false,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Retries after the first failed attempt.
    pub fn retry(mut self, retries: u32) -> Self {
        self.retry = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Transform applied to the raw value on every read. Never cached.
    pub fn select<F>(mut self, select: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.select = Some(Arc::new(select));
        self
    }

    /// Shown while nothing real is available. Never written to the cache.
    pub fn placeholder_data(mut self, data: T) -> Self {
        self.placeholder_data = Some(data);
        self
    }

    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    pub fn refetch_on_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_focus = refetch;
        self
    }

    pub fn refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = refetch;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

// == Query State ==
/// Lifecycle phase of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Disabled, nothing is fetched
    Idle,
    Loading,
    Success,
    /// Last value is past its stale time but still served
    Stale,
    Error,
    /// An attempt failed and a retry is scheduled
    Retrying,
}

/// What a consumer sees when it reads a binding.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    /// True only while fetching with nothing to show
    pub is_loading: bool,
    /// True while fetching with data still on display
    pub is_refetching: bool,
    pub is_stale: bool,
    pub error: Option<CacheError>,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
struct BindingState {
    status: QueryStatus,
    value: Option<Value>,
    fetching: bool,
    /// A foreground refetch without keep-previous hides the retained value
    hide_previous: bool,
    error: Option<CacheError>,
    retry_count: u32,
}

impl BindingState {
    fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            value: None,
            fetching: false,
            hide_previous: false,
            error: None,
            retry_count: 0,
        }
    }
}

// == Binding Core ==
struct BindingCore<T> {
    client: QueryClient,
    options: QueryOptions<T>,
    state: watch::Sender<BindingState>,
    enabled: AtomicBool,
    active: AtomicBool,
    subscribed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> BindingCore<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.options.key
    }

    fn is_live(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.enabled.load(Ordering::SeqCst)
    }

    fn fetch_options(&self) -> FetchOptions {
        let mut retry = self.client.default_retry();
        if let Some(retries) = self.options.retry {
            retry.max_retries = retries;
        }
        if let Some(delay) = self.options.retry_delay {
            retry.base_delay = delay;
        }

        let entry = match (self.options.ttl, self.options.stale_time) {
            (None, None) => None,
            (ttl, stale_time) => {
                let defaults = self.client.default_entry_options();
                Some(EntryOptions::new(
                    ttl.unwrap_or(defaults.ttl),
                    stale_time.unwrap_or(defaults.stale_time),
                ))
            }
        };

        FetchOptions { retry, entry }
    }

    fn decode(&self, raw: &Value) -> Result<T> {
        let decoded = match &self.options.select {
            Some(select) => select(raw),
            None => serde_json::from_value(raw.clone()).map_err(anyhow::Error::from),
        };
        decoded.map_err(|err| CacheError::Decode {
            key: self.options.key.clone(),
            message: err.to_string(),
        })
    }

    fn snapshot(&self) -> QueryState<T> {
        let state = self.state.borrow().clone();

        let visible = if state.fetching && state.hide_previous {
            None
        } else {
            state.value.as_ref()
        };
        let is_stale = visible.is_some()
            && self
                .client
                .entry_state(self.key())
                .map_or(true, EntryState::needs_refetch);

        let (data, decode_error) = match visible {
            Some(raw) => match self.decode(raw) {
                Ok(data) => (Some(data), None),
                Err(err) => (None, Some(err)),
            },
            None => (self.options.placeholder_data.clone(), None),
        };

        let status = match state.status {
            QueryStatus::Success if is_stale => QueryStatus::Stale,
            status => status,
        };

        QueryState {
            data,
            status,
            is_loading: state.fetching && visible.is_none(),
            is_refetching: state.fetching && visible.is_some(),
            is_stale,
            error: decode_error.or(state.error),
            retry_count: state.retry_count,
        }
    }

    // == Activation ==
    /// Subscribes to the key and loads it. Fresh cache hits resolve inline.
    fn activate(self: &Arc<Self>) {
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            self.client.subscribe_key(self.key());
        }

        match self.client.get(self.key()) {
            Some(hit) if hit.state == EntryState::Fresh => {
                self.state.send_modify(|s| {
                    s.status = QueryStatus::Success;
                    s.value = Some(hit.value);
                    s.error = None;
                });
            }
            cached => {
                self.state.send_modify(|s| {
                    s.fetching = true;
                    match cached {
                        Some(hit) => {
                            s.value = Some(hit.value);
                            s.status = QueryStatus::Success;
                        }
                        None => s.status = QueryStatus::Loading,
                    }
                });
                self.spawn_load(false, true);
            }
        }
    }

    fn deactivate(&self) {
        self.abort_tasks();
        if self.subscribed.swap(false, Ordering::SeqCst) {
            self.client.unsubscribe_key(self.key());
        }
    }

    fn spawn_load(self: &Arc<Self>, force: bool, background: bool) {
        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // Failures are recorded in the binding state.
            let _ = core.load(force, background).await;
        });
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    // == Load ==
    /// Brings the binding up to date.
    ///
    /// Without `force`, a fresh entry is served as-is. A `background` load
    /// keeps serving the cached value while it revalidates; a foreground one
    /// enters `Loading` and hides the value unless keep-previous is set.
    async fn load(&self, force: bool, background: bool) -> Result<Option<Value>> {
        if !self.is_live() {
            return Ok(None);
        }

        if !force {
            match self.client.get(self.key()) {
                Some(hit) if hit.state == EntryState::Fresh => {
                    self.state.send_modify(|s| {
                        s.status = QueryStatus::Success;
                        s.value = Some(hit.value.clone());
                        s.fetching = false;
                        s.hide_previous = false;
                        s.error = None;
                    });
                    return Ok(Some(hit.value));
                }
                Some(hit) => {
                    debug!(key = self.key(), state = ?hit.state, "serving cached value while revalidating");
                    self.state.send_modify(|s| {
                        s.value = Some(hit.value);
                        if s.status == QueryStatus::Loading || s.status == QueryStatus::Idle {
                            s.status = QueryStatus::Success;
                        }
                    });
                }
                None => {}
            }
        }

        let hide = !background && !self.options.keep_previous_data;
        self.state.send_modify(|s| {
            // Joining a foreground load keeps its data hidden.
            s.hide_previous = if s.fetching { s.hide_previous || hide } else { hide };
            s.fetching = true;
            if !background || s.value.is_none() {
                s.status = QueryStatus::Loading;
            }
        });

        let pending = self
            .client
            .fetch(self.key(), self.options.fetcher.clone(), self.fetch_options());
        let outcome = self.await_with_progress(pending).await;

        if !self.is_live() {
            debug!(key = self.key(), "binding inactive, discarding fetch result");
            return outcome.map(|fetched| Some(fetched.value));
        }

        match outcome {
            Ok(fetched) => {
                self.state.send_modify(|s| {
                    s.status = QueryStatus::Success;
                    s.value = Some(fetched.value.clone());
                    s.fetching = false;
                    s.hide_previous = false;
                    s.error = None;
                    s.retry_count = fetched.retries;
                });
                Ok(Some(fetched.value))
            }
            Err(err) => {
                self.state.send_modify(|s| {
                    s.status = QueryStatus::Error;
                    s.fetching = false;
                    s.hide_previous = false;
                    if let Some(attempts) = err.attempts() {
                        s.retry_count = attempts.saturating_sub(1);
                    }
                    s.error = Some(err.clone());
                });
                Err(err)
            }
        }
    }

    /// Waits for the fetch while mirroring its retry counter.
    async fn await_with_progress(&self, pending: PendingFetch) -> FetchResult {
        let mut attempts = pending.attempts();
        let outcome = pending.wait();
        tokio::pin!(outcome);

        loop {
            tokio::select! {
                result = &mut outcome => return result,
                changed = attempts.changed() => {
                    if changed.is_err() {
                        return outcome.await;
                    }
                    let retries = *attempts.borrow_and_update();
                    self.state.send_modify(|s| {
                        s.status = QueryStatus::Retrying;
                        s.retry_count = retries;
                    });
                }
            }
        }
    }

    // == Notifications ==
    fn on_cache_event(self: &Arc<Self>, event: CacheEvent) {
        if !self.is_live() {
            return;
        }
        match event {
            CacheEvent::Updated { .. } => {
                let Some(value) = self.client.peek(self.key()) else {
                    return;
                };
                self.state.send_modify(|s| {
                    s.value = Some(value);
                    if !s.fetching {
                        s.status = QueryStatus::Success;
                        s.error = None;
                    }
                });
            }
            CacheEvent::Invalidated { .. } => {
                debug!(key = self.key(), "entry invalidated, refetching");
                self.spawn_load(false, false);
            }
            CacheEvent::Removed { .. } => {}
        }
    }

    fn on_host_event(self: &Arc<Self>, event: HostEvent) {
        let wanted = match event {
            HostEvent::Focus => self.options.refetch_on_focus,
            HostEvent::Online => self.options.refetch_on_reconnect,
            _ => false,
        };
        if wanted && self.should_revalidate() {
            debug!(key = self.key(), ?event, "revalidating on host signal");
            self.spawn_load(true, false);
        }
    }

    /// Revalidate only stale or failed bindings, never fresh ones.
    fn should_revalidate(&self) -> bool {
        if !self.is_live() {
            return false;
        }
        let state = self.state.borrow();
        if state.fetching {
            return false;
        }
        if state.status == QueryStatus::Error {
            return true;
        }
        state.value.is_some()
            && self
                .client
                .entry_state(self.key())
                .map_or(true, EntryState::needs_refetch)
    }
}

fn spawn_listener<T>(core: Arc<BindingCore<T>>) -> JoinHandle<()>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut cache_events = core.client.events();
    let mut host_events = core.client.env().subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = cache_events.recv() => match event {
                    Ok(event) if event.key() == core.key() => core.on_cache_event(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(key = core.key(), skipped, "binding lagged behind cache events");
                    }
                    Err(RecvError::Closed) => break,
                },
                event = host_events.recv() => match event {
                    Ok(event) => core.on_host_event(event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

// == Query Binding ==
/// Live view over one cache key.
///
/// Dropping the binding unsubscribes it. A fetch already issued keeps
/// running and still writes the cache, but the binding ignores the result.
pub struct QueryBinding<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    core: Arc<BindingCore<T>>,
    listener: JoinHandle<()>,
}

impl<T> QueryBinding<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(client: QueryClient, options: QueryOptions<T>) -> Self {
        let enabled = options.enabled;
        let (state, _) = watch::channel(BindingState::idle());
        let core = Arc::new(BindingCore {
            client,
            options,
            state,
            enabled: AtomicBool::new(enabled),
            active: AtomicBool::new(true),
            subscribed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let listener = spawn_listener(core.clone());
        if enabled {
            core.activate();
        }

        Self { core, listener }
    }

    pub fn key(&self) -> &str {
        self.core.key()
    }

    /// Current state, decoded from the latest value.
    pub fn snapshot(&self) -> QueryState<T> {
        self.core.snapshot()
    }

    pub fn data(&self) -> Option<T> {
        self.snapshot().data
    }

    /// Waits until no fetch is in progress, then returns the state.
    pub async fn settled(&self) -> QueryState<T> {
        let mut state = self.core.state.subscribe();
        let _ = state.wait_for(|s| !s.fetching).await;
        self.snapshot()
    }

    /// Fetches regardless of freshness. Clears the error and retry count first.
    ///
    /// Does nothing while the binding is disabled.
    pub async fn refetch(&self) -> Result<Option<T>> {
        if !self.core.is_live() {
            return Ok(None);
        }
        self.core.state.send_modify(|s| {
            s.error = None;
            s.retry_count = 0;
        });
        let value = self.core.load(true, false).await?;
        value.map(|raw| self.core.decode(&raw)).transpose()
    }

    /// Marks the key expired and refetches it.
    pub async fn invalidate(&self) -> Result<Option<T>> {
        self.core.client.invalidate(self.key());
        self.refetch().await
    }

    pub fn is_enabled(&self) -> bool {
        self.core.enabled.load(Ordering::SeqCst)
    }

    /// Enables or disables the binding.
    ///
    /// Disabling drops the binding's pending work and returns it to idle;
    /// enabling loads the key as on creation.
    pub fn set_enabled(&self, enabled: bool) {
        if self.core.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        if enabled {
            self.core.activate();
        } else {
            self.core.deactivate();
            self.core.state.send_modify(|s| {
                s.status = QueryStatus::Idle;
                s.fetching = false;
                s.hide_previous = false;
            });
        }
    }
}

impl<T> Drop for QueryBinding<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.active.store(false, Ordering::SeqCst);
        self.listener.abort();
        self.core.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::config::Config;
    use crate::env::HostEnvironment;
    use crate::fetch::fetcher;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn client() -> QueryClient {
        QueryClient::new(Config::default(), Arc::new(HostEnvironment::new()))
    }

    fn counting(calls: &Arc<AtomicU32>, value: Value) -> Fetcher {
        let calls = calls.clone();
        fetcher(move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
    }

    #[tokio::test]
    async fn test_resolves_typed_data() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query::<User>(QueryOptions::new(
            "test-key",
            counting(&calls, json!({"id": 1, "name": "Test"})),
        ));

        let state = binding.settled().await;

        assert_eq!(state.data, Some(User { id: 1, name: "Test".into() }));
        assert!(!state.is_loading);
        assert!(state.error.is_none());
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(client.subscriber_count("test-key"), 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_fetch() {
        let client = client();
        client.set("k", json!({"id": 2, "name": "Cached"}), None).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let binding = client.query::<User>(QueryOptions::new("k", counting(&calls, json!(null))));
        let state = binding.snapshot();

        assert_eq!(state.data.map(|u| u.name), Some("Cached".to_string()));
        assert!(!state.is_loading);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_select_applies_on_every_read() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query(
            QueryOptions::new("user:1", counting(&calls, json!({"id": 1, "name": "Ada"})))
                .select(|raw| Ok(raw["name"].as_str().unwrap_or_default().to_uppercase())),
        );

        assert_eq!(binding.settled().await.data.as_deref(), Some("ADA"));
        // The raw value stays in the cache.
        assert_eq!(client.get("user:1").unwrap().value["name"], "Ada");
    }

    #[tokio::test]
    async fn test_placeholder_is_never_cached() {
        let client = client();
        let gate = Arc::new(Notify::new());
        let fetch = {
            let gate = gate.clone();
            fetcher(move || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(json!("real"))
                }
            })
        };

        let binding =
            client.query(QueryOptions::new("k", fetch).placeholder_data("placeholder".to_string()));
        let loading = binding.snapshot();
        assert!(loading.is_loading);
        assert_eq!(loading.data.as_deref(), Some("placeholder"));
        assert!(client.get("k").is_none());

        gate.notify_one();
        assert_eq!(binding.settled().await.data.as_deref(), Some("real"));
    }

    #[tokio::test]
    async fn test_disabled_binding_stays_idle() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query::<Value>(
            QueryOptions::new("k", counting(&calls, json!(1))).enabled(false),
        );

        let state = binding.settled().await;
        assert_eq!(state.status, QueryStatus::Idle);
        assert!(binding.refetch().await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        binding.set_enabled(true);
        assert_eq!(binding.settled().await.data, Some(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query::<Value>(QueryOptions::new("k", counting(&calls, json!(1))));
        binding.settled().await;
        assert_eq!(client.subscriber_count("k"), 1);

        drop(binding);
        assert_eq!(client.subscriber_count("k"), 0);
    }

    fn failing(calls: &Arc<AtomicU32>) -> Fetcher {
        let calls = calls.clone();
        fetcher(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("unavailable"))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_retrying_during_backoff() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query::<Value>(
            QueryOptions::new("k", failing(&calls))
                .retry(3)
                .retry_delay(Duration::from_secs(1)),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = binding.snapshot();
        assert_eq!(state.status, QueryStatus::Retrying);
        assert_eq!(state.retry_count, 1);
        assert!(state.is_loading);
        assert!(state.error.is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(binding.snapshot().retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_during_backoff_stops_retries() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query::<Value>(
            QueryOptions::new("k", failing(&calls))
                .retry(3)
                .retry_delay(Duration::from_secs(1)),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        binding.set_enabled(false);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!client.is_fetching("k"));
        assert_eq!(binding.snapshot().status, QueryStatus::Idle);
    }

    #[tokio::test]
    async fn test_decode_failure_surfaces_as_error() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let binding = client.query::<User>(QueryOptions::new("k", counting(&calls, json!("nope"))));

        let state = binding.settled().await;
        assert!(state.data.is_none());
        assert!(matches!(state.error, Some(CacheError::Decode { .. })));
    }
}
