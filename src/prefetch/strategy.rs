//! Prefetch strategies.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::client::QueryClient;
use crate::env::NetworkStatus;
use crate::fetch::Fetcher;

/// Priority tier. Orders from most to least severe, so sorting runs
/// critical work first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Runs regardless of network conditions
    Critical,
    High,
    Normal,
    Low,
}

/// What a strategy sees when it is evaluated.
#[derive(Debug, Clone)]
pub struct PrefetchContext {
    /// Route the strategy was registered for
    pub route: String,
    pub network: NetworkStatus,
    pub client: QueryClient,
}

pub type Condition = Arc<dyn Fn(&PrefetchContext) -> bool + Send + Sync>;
pub type Action = Arc<dyn Fn(PrefetchContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One unit of background loading attached to a route.
#[derive(Clone)]
pub struct PrefetchStrategy {
    pub name: String,
    pub priority: Priority,
    condition: Option<Condition>,
    action: Action,
    /// Run after this delay instead of inline
    pub delay: Option<Duration>,
}

impl PrefetchStrategy {
    pub fn new<F, Fut>(name: impl Into<String>, priority: Priority, action: F) -> Self
    where
        F: Fn(PrefetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            condition: None,
            action: Arc::new(move |ctx| action(ctx).boxed()),
            delay: None,
        }
    }

    /// Strategy that prefetches one cache key.
    pub fn query(
        name: impl Into<String>,
        priority: Priority,
        key: impl Into<String>,
        fetcher: Fetcher,
    ) -> Self {
        let key = key.into();
        Self::new(name, priority, move |ctx: PrefetchContext| {
            ctx.client
                .prefetch(&key, fetcher.clone(), ctx.client.fetch_options());
            futures::future::ready(Ok(()))
        })
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&PrefetchContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn should_run(&self, ctx: &PrefetchContext) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition(ctx))
    }

    pub(crate) fn run(&self, ctx: PrefetchContext) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for PrefetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("delay", &self.delay)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}
