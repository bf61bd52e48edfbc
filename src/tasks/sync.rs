//! Periodic Sync Task
//!
//! Refetches one key on a fixed interval. While the host reports the page
//! hidden the loop is parked; on visibility it starts a fresh interval rather
//! than resuming the interrupted one.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::QueryClient;
use crate::env::wait_for_visibility;
use crate::fetch::Fetcher;

/// Spawns a task that refetches `key` every `interval` while visible.
///
/// The task is tied to the client and stops when the client is disposed.
pub fn spawn_periodic_sync(
    client: &QueryClient,
    key: impl Into<String>,
    fetcher: Fetcher,
    interval: Duration,
) -> JoinHandle<()> {
    let key = key.into();
    let task_client = client.clone();
    let scheduler = client.scheduler();
    let mut visible = client.env().watch_visibility();

    let handle = tokio::spawn(async move {
        info!(%key, ?interval, "starting periodic sync");

        loop {
            if !wait_for_visibility(&mut visible, true).await {
                break;
            }

            tokio::select! {
                _ = scheduler.sleep(interval) => {
                    let options = task_client.fetch_options();
                    match task_client.fetch(&key, fetcher.clone(), options).await {
                        Ok(_) => debug!(%key, "periodic sync refreshed entry"),
                        Err(err) => warn!(%key, error = %err, "periodic sync failed"),
                    }
                }
                still_open = wait_for_visibility(&mut visible, false) => {
                    if !still_open {
                        break;
                    }
                    debug!(%key, "page hidden, pausing periodic sync");
                }
            }
        }
    });

    client.track_task(handle.abort_handle());
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;
    use serde_json::json;

    use crate::config::Config;
    use crate::env::HostEnvironment;
    use crate::fetch::fetcher;
    use crate::lock;
    use crate::scheduler::{Scheduler, TaskHandle, TokioScheduler};

    /// Tokio timers, with every requested sleep recorded.
    #[derive(Debug, Default)]
    struct RecordingScheduler {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
            TokioScheduler.schedule(delay, task)
        }

        fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
            lock(&self.sleeps).push(delay);
            TokioScheduler.sleep(delay)
        }
    }

    fn counting_fetcher(calls: &Arc<AtomicU32>) -> Fetcher {
        let calls = calls.clone();
        fetcher(move || {
            let calls = calls.clone();
            async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_refetches_on_interval() {
        let env = Arc::new(HostEnvironment::new());
        let client = QueryClient::new(Config::default(), env);
        let calls = Arc::new(AtomicU32::new(0));

        let handle = spawn_periodic_sync(
            &client,
            "metrics",
            counting_fetcher(&calls),
            Duration::from_secs(10),
        );
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.get("metrics").unwrap().value, json!(2));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_pauses_while_hidden_and_reschedules() {
        let env = Arc::new(HostEnvironment::new());
        let client = QueryClient::new(Config::default(), env.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let _handle = spawn_periodic_sync(
            &client,
            "metrics",
            counting_fetcher(&calls),
            Duration::from_secs(10),
        );
        tokio::time::sleep(Duration::from_secs(25)).await;
        env.set_visible(false);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        env.set_visible(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_waits_on_client_scheduler() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let client = QueryClient::with_scheduler(
            Config::default(),
            Arc::new(HostEnvironment::new()),
            scheduler.clone(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let handle = spawn_periodic_sync(
            &client,
            "metrics",
            counting_fetcher(&calls),
            Duration::from_secs(10),
        );
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(*lock(&scheduler.sleeps), vec![Duration::from_secs(10); 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
