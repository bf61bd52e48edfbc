//! Timer abstraction.
//!
//! Backoff, delayed prefetch and periodic work all go through a [`Scheduler`]
//! so tests can substitute virtual time.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Source of delays for the cache core.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Runs `task` after `delay` in the background.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle;

    /// Resolves after `delay`.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Scheduler backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        TaskHandle::new(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        }))
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}
