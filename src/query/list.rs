//! List Accumulator
//!
//! Page-based fetching with accumulation. Every page is cached under its own
//! key derived from the base key, page number, page size and filters. Page 1
//! replaces the accumulated items, later pages append, and a filter change
//! starts over from page 1.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{list_key, EntryOptions};
use crate::client::QueryClient;
use crate::error::{CacheError, Result};
use crate::fetch::{fetcher, FetchOptions, Fetcher};
use crate::lock;

// == Page ==
/// One page of results as returned by a page fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of items across all pages, if known
    #[serde(default)]
    pub total: Option<u64>,
    /// Explicit continuation flag, if the source reports one
    #[serde(default)]
    pub has_more: Option<bool>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            total: None,
            has_more: None,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = Some(has_more);
        self
    }
}

/// Arguments handed to a page fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
    pub filters: Value,
}

pub type PageFetcher<T> =
    Arc<dyn Fn(PageRequest) -> BoxFuture<'static, anyhow::Result<Page<T>>> + Send + Sync>;

/// Wraps an async closure as a [`PageFetcher`].
pub fn page_fetcher<T, F, Fut>(f: F) -> PageFetcher<T>
where
    F: Fn(PageRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Page<T>>> + Send + 'static,
{
    Arc::new(move |request| f(request).boxed())
}

// == List Options ==
/// Configuration for one list binding.
pub struct ListOptions<T> {
    base_key: String,
    fetcher: PageFetcher<T>,
    page_size: u32,
    filters: Value,
    retry: Option<u32>,
    retry_delay: Option<Duration>,
    ttl: Option<Duration>,
    stale_time: Option<Duration>,
}

impl<T> ListOptions<T> {
    pub fn new(base_key: impl Into<String>, fetcher: PageFetcher<T>) -> Self {
        Self {
            base_key: base_key.into(),
            fetcher,
            page_size: 20,
            filters: Value::Object(Default::default()),
            retry: None,
            retry_delay: None,
            ttl: None,
            stale_time: None,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn filters(mut self, filters: Value) -> Self {
        self.filters = filters;
        self
    }

    pub fn retry(mut self, retries: u32) -> Self {
        self.retry = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
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
}

// == List State ==
/// What a consumer sees when it reads a list binding.
#[derive(Debug, Clone)]
pub struct ListState<T> {
    pub items: Vec<T>,
    pub is_loading: bool,
    pub error: Option<CacheError>,
    pub has_more: bool,
    pub total: Option<u64>,
    pub page: u32,
    pub filters: Value,
}

#[derive(Debug, Clone)]
struct Accumulator<T> {
    view: ListState<T>,
    /// Bumped on every reset; results from older generations are dropped
    generation: u64,
    /// Page 1 of the current generation has loaded
    first_loaded: bool,
}

struct ListCore<T> {
    client: QueryClient,
    options: ListOptions<T>,
    state: watch::Sender<Accumulator<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> ListCore<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    fn fetch_options(&self) -> FetchOptions {
        let mut options = self.client.fetch_options();
        if let Some(retries) = self.options.retry {
            options.retry.max_retries = retries;
        }
        if let Some(delay) = self.options.retry_delay {
            options.retry.base_delay = delay;
        }
        if self.options.ttl.is_some() || self.options.stale_time.is_some() {
            let defaults = self.client.default_entry_options();
            options.entry = Some(EntryOptions::new(
                self.options.ttl.unwrap_or(defaults.ttl),
                self.options.stale_time.unwrap_or(defaults.stale_time),
            ));
        }
        options
    }

    /// Adapts the page fetcher to the cache's untyped fetcher.
    fn cache_fetcher(&self, request: PageRequest) -> Fetcher {
        let pages = self.options.fetcher.clone();
        fetcher(move || {
            let page = pages(request.clone());
            async move { Ok(serde_json::to_value(page.await?)?) }
        })
    }

    fn request(&self, view: &ListState<T>) -> PageRequest {
        PageRequest {
            page: view.page,
            page_size: self.options.page_size,
            filters: view.filters.clone(),
        }
    }

    async fn fetch_page(&self, request: PageRequest, generation: u64) -> Result<()> {
        let key = list_key(
            &self.options.base_key,
            request.page,
            request.page_size,
            &request.filters,
        );
        let page_size = request.page_size as usize;
        let page_number = request.page;

        let outcome = self
            .client
            .fetch_query(&key, self.cache_fetcher(request), self.fetch_options())
            .await
            .and_then(|fetched| {
                serde_json::from_value::<Page<T>>(fetched.value).map_err(|err| {
                    CacheError::Decode {
                        key: key.clone(),
                        message: err.to_string(),
                    }
                })
            });

        let mut result = Ok(());
        self.state.send_if_modified(|acc| {
            if acc.generation != generation {
                debug!(%key, "discarding page for superseded filters");
                return false;
            }
            let view = &mut acc.view;
            view.is_loading = false;

            match outcome {
                Ok(page) => {
                    let received = page.items.len();
                    if page_number == 1 {
                        acc.first_loaded = true;
                        view.items = page.items;
                    } else {
                        view.items.extend(page.items);
                    }
                    if page.total.is_some() {
                        view.total = page.total;
                    }
                    view.has_more = match (page.has_more, view.total) {
                        (Some(has_more), _) => has_more,
                        (None, Some(total)) => (view.items.len() as u64) < total,
                        (None, None) => received == page_size,
                    };
                    view.error = None;
                }
                Err(err) => {
                    // The page was never loaded, so the next load_more retries it.
                    if page_number > 1 {
                        view.page = page_number - 1;
                    }
                    view.error = Some(err.clone());
                    result = Err(err);
                }
            }
            true
        });
        result
    }

    fn spawn_fetch(self: &Arc<Self>, request: PageRequest, generation: u64) {
        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = core.fetch_page(request, generation).await;
        });
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

// == List Binding ==
/// Accumulating view over a paginated source.
pub struct ListBinding<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    core: Arc<ListCore<T>>,
}

impl<T> ListBinding<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(client: QueryClient, options: ListOptions<T>) -> Self {
        let view = ListState {
            items: Vec::new(),
            is_loading: true,
            error: None,
            has_more: true,
            total: None,
            page: 1,
            filters: options.filters.clone(),
        };
        let (state, _) = watch::channel(Accumulator {
            view,
            generation: 0,
            first_loaded: false,
        });
        let core = Arc::new(ListCore {
            client,
            options,
            state,
            tasks: Mutex::new(Vec::new()),
        });

        let request = core.request(&core.state.borrow().view);
        core.spawn_fetch(request, 0);
        Self { core }
    }

    pub fn snapshot(&self) -> ListState<T> {
        self.core.state.borrow().view.clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.snapshot().items
    }

    /// Waits until no page fetch is in progress.
    pub async fn settled(&self) -> ListState<T> {
        let mut state = self.core.state.subscribe();
        let _ = state.wait_for(|acc| !acc.view.is_loading).await;
        self.snapshot()
    }

    // == Load More ==
    /// Fetches the next page.
    ///
    /// No-op unless more pages are expected and no fetch is in flight. If
    /// page 1 has not loaded yet, it is fetched again instead.
    pub async fn load_more(&self) -> Result<()> {
        let mut next = None;
        self.core.state.send_if_modified(|acc| {
            let view = &mut acc.view;
            if !view.has_more || view.is_loading {
                return false;
            }
            if acc.first_loaded {
                view.page += 1;
            } else {
                debug!(base_key = %self.core.options.base_key, "first page missing, retrying it");
                view.page = 1;
            }
            view.is_loading = true;
            view.error = None;
            next = Some((self.core.request(view), acc.generation));
            true
        });

        match next {
            Some((request, generation)) => self.core.fetch_page(request, generation).await,
            None => Ok(()),
        }
    }

    // == Refresh ==
    /// Expires every cached page of this list and reloads page 1.
    pub async fn refresh(&self) -> Result<()> {
        let page_prefix = format!("{}:page=", self.core.options.base_key);
        for key in self.core.client.keys_with_prefix(&self.core.options.base_key) {
            if key.starts_with(&page_prefix) {
                self.core.client.invalidate(&key);
            }
        }

        let mut next = None;
        self.core.state.send_modify(|acc| {
            acc.generation += 1;
            acc.first_loaded = false;
            let view = &mut acc.view;
            view.page = 1;
            view.has_more = true;
            view.is_loading = true;
            view.error = None;
            next = Some((self.core.request(view), acc.generation));
        });

        match next {
            Some((request, generation)) => self.core.fetch_page(request, generation).await,
            None => Ok(()),
        }
    }

    // == Set Filters ==
    /// Replaces the filters. A change by value resets the list to page 1.
    pub async fn set_filters(&self, filters: Value) -> Result<()> {
        let mut next = None;
        self.core.state.send_if_modified(|acc| {
            if acc.view.filters == filters {
                return false;
            }
            acc.generation += 1;
            acc.first_loaded = false;
            let view = &mut acc.view;
            view.filters = filters;
            view.page = 1;
            view.items.clear();
            view.has_more = true;
            view.total = None;
            view.is_loading = true;
            view.error = None;
            next = Some((self.core.request(view), acc.generation));
            true
        });

        match next {
            Some((request, generation)) => {
                debug!(base_key = %self.core.options.base_key, "filters changed, list reset");
                self.core.fetch_page(request, generation).await
            }
            None => Ok(()),
        }
    }
}

impl<T> Drop for ListBinding<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        for task in lock(&self.core.tasks).drain(..) {
            task.abort();
        }
    }
}
