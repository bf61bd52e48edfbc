//! Prefetch Manager
//!
//! Runs route-keyed strategies under network gating, predicts the next
//! routes from navigation history and prefetches their strategies too.
//! Everything here is best-effort: failures are counted and logged, never
//! returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::QueryClient;
use crate::config::PrefetchConfig;
use crate::lock;
use crate::prefetch::predictor::BehaviorPredictor;
use crate::prefetch::schedule::{schedule_at, schedule_when_idle};
use crate::prefetch::{NetworkGate, PrefetchContext, PrefetchStrategy};
use crate::scheduler::TaskHandle;
use crate::storage::KeyValueStorage;

/// Counters and predictor state reported by [`PrefetchManager::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchStats {
    /// Strategy actions that completed
    pub executed: u64,
    /// Strategy actions that returned an error
    pub failed: u64,
    pub skipped_by_network: u64,
    pub skipped_by_condition: u64,
    /// Follower routes prefetched on prediction
    pub predicted: u64,
    /// Strategies deferred to a delay, a time of day or an idle period
    pub scheduled: u64,
    pub history_length: usize,
    pub pattern_count: usize,
    pub pending_predictions: usize,
    pub enabled: bool,
}

pub(crate) struct ManagerInner {
    pub(crate) client: QueryClient,
    pub(crate) config: PrefetchConfig,
    gate: NetworkGate,
    strategies: Mutex<HashMap<String, Vec<PrefetchStrategy>>>,
    predictor: Mutex<BehaviorPredictor>,
    enabled: AtomicBool,
    stats: Mutex<PrefetchStats>,
    scheduled: Mutex<Vec<TaskHandle>>,
}

impl ManagerInner {
    fn context(&self, route: &str) -> PrefetchContext {
        PrefetchContext {
            route: route.to_string(),
            network: self.client.env().network(),
            client: self.client.clone(),
        }
    }

    fn admit(&self, strategy: &PrefetchStrategy, ctx: &PrefetchContext) -> bool {
        if !self.gate.allows(strategy.priority, &ctx.network) {
            debug!(strategy = %strategy.name, priority = ?strategy.priority, "prefetch skipped by network gate");
            lock(&self.stats).skipped_by_network += 1;
            return false;
        }
        if !strategy.should_run(ctx) {
            debug!(strategy = %strategy.name, "prefetch skipped by condition");
            lock(&self.stats).skipped_by_condition += 1;
            return false;
        }
        true
    }

    async fn execute(&self, strategy: &PrefetchStrategy, ctx: PrefetchContext) {
        match strategy.run(ctx).await {
            Ok(()) => {
                debug!(strategy = %strategy.name, "prefetch strategy executed");
                lock(&self.stats).executed += 1;
            }
            Err(err) => {
                warn!(strategy = %strategy.name, error = %err, "prefetch strategy failed");
                lock(&self.stats).failed += 1;
            }
        }
    }

    /// Gate check and run for deferred strategies, evaluated when they fire.
    ///
    /// Conditions and network state are read at fire time, not schedule time.
    pub(crate) async fn execute_gated(&self, strategy: &PrefetchStrategy, route: &str) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let ctx = self.context(route);
        if self.admit(strategy, &ctx) {
            self.execute(strategy, ctx).await;
        }
    }

    async fn run_route(self: &Arc<Self>, route: &str) {
        let mut strategies = lock(&self.strategies)
            .get(route)
            .cloned()
            .unwrap_or_default();
        strategies.sort_by_key(|strategy| strategy.priority);

        let ctx = self.context(route);
        for strategy in strategies {
            if !self.admit(&strategy, &ctx) {
                continue;
            }
            match strategy.delay.filter(|delay| !delay.is_zero()) {
                Some(delay) => {
                    let inner = Arc::clone(self);
                    let route = route.to_string();
                    let handle = self.client.scheduler().schedule(
                        delay,
                        Box::pin(async move { inner.execute_gated(&strategy, &route).await }),
                    );
                    lock(&self.stats).scheduled += 1;
                    self.track(handle);
                }
                None => self.execute(&strategy, ctx.clone()).await,
            }
        }
    }

    fn track(&self, handle: TaskHandle) {
        let mut scheduled = lock(&self.scheduled);
        scheduled.retain(|task| !task.is_finished());
        scheduled.push(handle);
    }
}

// == Prefetch Manager ==
#[derive(Clone)]
pub struct PrefetchManager {
    inner: Arc<ManagerInner>,
}

impl PrefetchManager {
    /// Creates a manager without persistent history.
    pub fn new(client: QueryClient) -> Self {
        Self::build(client, None)
    }

    /// Creates a manager whose navigation history survives restarts.
    pub fn with_storage(client: QueryClient, storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::build(client, Some(storage))
    }

    fn build(client: QueryClient, storage: Option<Arc<dyn KeyValueStorage>>) -> Self {
        let config = client.config().prefetch.clone();
        let predictor =
            BehaviorPredictor::new(config.history_limit, config.prediction_timeout, storage);
        info!(
            history_limit = config.history_limit,
            restored = predictor.history_len(),
            "prefetch manager initialized"
        );

        Self {
            inner: Arc::new(ManagerInner {
                gate: NetworkGate::new(&config),
                config,
                client,
                strategies: Mutex::new(HashMap::new()),
                predictor: Mutex::new(predictor),
                enabled: AtomicBool::new(true),
                stats: Mutex::new(PrefetchStats::default()),
                scheduled: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attaches a strategy to `route`.
    pub fn register(&self, route: impl Into<String>, strategy: PrefetchStrategy) {
        lock(&self.inner.strategies)
            .entry(route.into())
            .or_default()
            .push(strategy);
    }

    // == Prefetch For Route ==
    /// Handles a navigation to `route`.
    ///
    /// Runs the route's eligible strategies in priority order, then records
    /// the navigation and runs the strategies of every newly predicted
    /// follower route.
    pub async fn prefetch_for_route(&self, route: &str) {
        if !self.is_enabled() {
            debug!(route, "prefetching disabled");
            return;
        }

        self.inner.run_route(route).await;

        let predicted = lock(&self.inner.predictor).record(route);
        for next in predicted {
            lock(&self.inner.stats).predicted += 1;
            self.inner.run_route(&next).await;
        }
    }

    /// Runs `strategy` every day at local time `at` while visible.
    pub fn schedule_at(&self, at: NaiveTime, strategy: PrefetchStrategy) {
        lock(&self.inner.stats).scheduled += 1;
        let handle = schedule_at(self.inner.clone(), at, strategy);
        self.inner.track(handle);
    }

    /// Runs `strategy` once when the host next reports idle.
    pub fn schedule_when_idle(&self, strategy: PrefetchStrategy) {
        lock(&self.inner.stats).scheduled += 1;
        let handle = schedule_when_idle(self.inner.clone(), strategy);
        self.inner.track(handle);
    }

    /// Turns prefetching on or off. Turning it off cancels deferred work.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            for handle in lock(&self.inner.scheduled).drain(..) {
                handle.cancel();
            }
        }
        info!(enabled, "prefetching toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> PrefetchStats {
        let mut stats = lock(&self.inner.stats).clone();
        let mut predictor = lock(&self.inner.predictor);
        stats.history_length = predictor.history_len();
        stats.pattern_count = predictor.pattern_count();
        stats.pending_predictions = predictor.pending_count();
        stats.enabled = self.is_enabled();
        stats
    }

    /// Navigation history, oldest first.
    pub fn history(&self) -> Vec<String> {
        lock(&self.inner.predictor).history()
    }
}

impl std::fmt::Debug for PrefetchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchManager")
            .field("enabled", &self.is_enabled())
            .field("routes", &lock(&self.inner.strategies).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use crate::config::Config;
    use crate::env::{ConnectionType, HostEnvironment, NetworkStatus};
    use crate::prefetch::Priority;

    fn manager(env: HostEnvironment) -> PrefetchManager {
        PrefetchManager::new(QueryClient::new(Config::default(), Arc::new(env)))
    }

    fn recording(name: &str, priority: Priority, log: &Arc<Mutex<Vec<String>>>) -> PrefetchStrategy {
        let log = log.clone();
        let label = name.to_string();
        PrefetchStrategy::new(name, priority, move |_| {
            lock(&log).push(label.clone());
            futures::future::ready(Ok(()))
        })
    }

    #[tokio::test]
    async fn test_strategies_run_critical_first() {
        let manager = manager(HostEnvironment::new());
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        manager.register("/home", recording("low", Priority::Low, &log));
        manager.register("/home", recording("critical", Priority::Critical, &log));
        manager.register("/home", recording("normal", Priority::Normal, &log));
        manager.register("/home", recording("high", Priority::High, &log));

        manager.prefetch_for_route("/home").await;

        assert_eq!(*lock(&log), vec!["critical", "high", "normal", "low"]);
        assert_eq!(manager.get_stats().executed, 4);
    }

    #[tokio::test]
    async fn test_conditions_and_failures_are_counted() {
        let manager = manager(HostEnvironment::new());
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        manager.register(
            "/home",
            recording("never", Priority::High, &log).with_condition(|_| false),
        );
        manager.register(
            "/home",
            PrefetchStrategy::new("broken", Priority::High, |_| async {
                Err(anyhow::anyhow!("boom"))
            }),
        );

        manager.prefetch_for_route("/home").await;

        let stats = manager.get_stats();
        assert_eq!(stats.skipped_by_condition, 1);
        assert_eq!(stats.failed, 1);
        assert!(lock(&log).is_empty());
    }

    #[tokio::test]
    async fn test_slow_network_runs_only_critical() {
        let env = HostEnvironment::new()
            .with_network(NetworkStatus::new(ConnectionType::Cellular2g, Some(0.2)));
        let manager = manager(env);
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        for (name, priority) in [
            ("critical", Priority::Critical),
            ("high", Priority::High),
            ("normal", Priority::Normal),
            ("low", Priority::Low),
        ] {
            manager.register("/home", recording(name, priority, &log));
        }

        manager.prefetch_for_route("/home").await;

        assert_eq!(*lock(&log), vec!["critical"]);
        assert_eq!(manager.get_stats().skipped_by_network, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_strategy_runs_later() {
        let manager = manager(HostEnvironment::new());
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        manager.register(
            "/home",
            recording("later", Priority::Normal, &log).with_delay(Duration::from_secs(2)),
        );

        manager.prefetch_for_route("/home").await;
        assert!(lock(&log).is_empty());
        assert_eq!(manager.get_stats().scheduled, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*lock(&log), vec!["later"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_strategy_is_gated_when_it_fires() {
        let env = Arc::new(HostEnvironment::new());
        let manager = PrefetchManager::new(QueryClient::new(Config::default(), env.clone()));
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        manager.register(
            "/home",
            recording("later", Priority::Normal, &log).with_delay(Duration::from_secs(2)),
        );

        manager.prefetch_for_route("/home").await;
        env.set_network(NetworkStatus::new(ConnectionType::Cellular2g, Some(0.2)));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(lock(&log).is_empty());
        let stats = manager.get_stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.skipped_by_network, 1);
        assert_eq!(stats.executed, 0);
    }

    fn at_offset(seconds: i64) -> NaiveTime {
        (chrono::Local::now() + chrono::Duration::seconds(seconds)).time()
    }

    fn counting(name: &str, runs: &Arc<AtomicU32>) -> PrefetchStrategy {
        let runs = runs.clone();
        PrefetchStrategy::new(name, Priority::Normal, move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_strategy_fires_and_rearms_next_day() {
        let manager = manager(HostEnvironment::new());
        let runs = Arc::new(AtomicU32::new(0));

        manager.schedule_at(at_offset(2), counting("nightly", &runs));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Nothing more until the same time tomorrow.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_strategy_waits_while_hidden() {
        let env = Arc::new(HostEnvironment::new());
        let manager = PrefetchManager::new(QueryClient::new(Config::default(), env.clone()));
        let runs = Arc::new(AtomicU32::new(0));

        manager.schedule_at(at_offset(2), counting("report", &runs));
        tokio::task::yield_now().await;
        env.set_visible(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // The timer restarts from the wall clock on visibility.
        env.set_visible(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_manager_does_nothing() {
        let manager = manager(HostEnvironment::new());
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        manager.register("/home", recording("critical", Priority::Critical, &log));

        manager.set_enabled(false);
        manager.prefetch_for_route("/home").await;

        assert!(lock(&log).is_empty());
        let stats = manager.get_stats();
        assert!(!stats.enabled);
        assert_eq!(stats.history_length, 0);
    }

    #[tokio::test]
    async fn test_predicted_followers_run_once() {
        let manager = manager(HostEnvironment::new());
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        manager.register(
            "/reports",
            PrefetchStrategy::new("reports", Priority::Normal, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(()))
            }),
        );

        manager.prefetch_for_route("/dashboard").await;
        manager.prefetch_for_route("/reports").await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Now /dashboard is known to lead to /reports.
        manager.prefetch_for_route("/dashboard").await;
        manager.prefetch_for_route("/dashboard").await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let stats = manager.get_stats();
        assert_eq!(stats.predicted, 1);
        assert_eq!(stats.pending_predictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_fallback_delay() {
        let manager = manager(HostEnvironment::new());
        let log: Arc<Mutex<Vec<String>>> = Arc::default();

        manager.schedule_when_idle(recording("idle", Priority::Low, &log));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(lock(&log).is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*lock(&log), vec!["idle"]);
    }

    #[tokio::test]
    async fn test_idle_event_triggers_strategy() {
        let env = Arc::new(HostEnvironment::new().with_idle_detection(true));
        let manager = PrefetchManager::new(QueryClient::new(Config::default(), env.clone()));
        let log: Arc<Mutex<Vec<String>>> = Arc::default();

        manager.schedule_when_idle(recording("idle", Priority::Low, &log));
        tokio::task::yield_now().await;
        env.idle();

        for _ in 0..10 {
            if !lock(&log).is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*lock(&log), vec!["idle"]);
    }
}
