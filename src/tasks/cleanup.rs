//! GC Task
//!
//! Background task that periodically removes entries past their TTL that no
//! binding is subscribed to.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::lock;
use crate::scheduler::Scheduler;

/// Spawns a background task that periodically evicts expired cache entries.
///
/// The task runs in an infinite loop, sleeping on `scheduler` for `interval`
/// between runs.
/// The store lock is only held for the sweep itself.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort it when the
/// owning client is disposed.
pub fn spawn_cleanup_task(
    cache: Arc<Mutex<CacheStore>>,
    scheduler: Arc<dyn Scheduler>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?interval, "starting cache GC task");

        loop {
            scheduler.sleep(interval).await;

            let removed = lock(&cache).cleanup_expired();

            if removed > 0 {
                info!(removed, "GC removed expired entries");
            } else {
                debug!("GC found no expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::cache::EntryOptions;
    use crate::scheduler::TokioScheduler;

    fn spawn(cache: Arc<Mutex<CacheStore>>) -> JoinHandle<()> {
        spawn_cleanup_task(cache, Arc::new(TokioScheduler), Duration::from_secs(1))
    }

    fn store() -> Arc<Mutex<CacheStore>> {
        Arc::new(Mutex::new(CacheStore::new(
            100,
            EntryOptions::new(Duration::from_secs(300), Duration::from_secs(30)),
        )))
    }

    fn short_lived() -> Option<EntryOptions> {
        Some(EntryOptions::new(Duration::from_secs(1), Duration::from_secs(1)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_removes_expired_entries() {
        let cache = store();
        lock(&cache).set("expire_soon", json!("value"), short_lived()).unwrap();

        let handle = spawn(cache.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(lock(&cache).peek("expire_soon").is_none());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_preserves_valid_and_subscribed_entries() {
        let cache = store();
        {
            let mut guard = lock(&cache);
            guard.set("long_lived", json!("value"), None).unwrap();
            guard.set("watched", json!("value"), short_lived()).unwrap();
            guard.subscribe("watched");
        }

        let handle = spawn(cache.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let guard = lock(&cache);
        assert_eq!(guard.peek("long_lived").unwrap().value, json!("value"));
        assert!(guard.peek("watched").is_some());
        drop(guard);
        handle.abort();
    }

    #[tokio::test]
    async fn test_gc_task_can_be_aborted() {
        let handle = spawn(store());

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
