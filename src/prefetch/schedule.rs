//! Time-of-day and idle scheduling for prefetch strategies.

use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::env::{wait_for_visibility, HostEvent};
use crate::prefetch::manager::ManagerInner;
use crate::prefetch::PrefetchStrategy;
use crate::scheduler::TaskHandle;

/// First occurrence of `at` strictly after `after`.
pub fn next_occurrence(after: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let same_day = after.date().and_time(at);
    if same_day > after {
        same_day
    } else {
        same_day + chrono::Duration::days(1)
    }
}

/// Wall-clock delay from `now` until the next `at`.
pub fn delay_until(now: NaiveDateTime, at: NaiveTime) -> Duration {
    (next_occurrence(now, at) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Runs `strategy` every day at local time `at`.
///
/// While the host is hidden the timer is dropped; on visibility the next
/// occurrence is computed again.
pub(crate) fn schedule_at(
    inner: std::sync::Arc<ManagerInner>,
    at: NaiveTime,
    strategy: PrefetchStrategy,
) -> TaskHandle {
    let mut visible = inner.client.env().watch_visibility();
    let scheduler = inner.client.scheduler();

    TaskHandle::new(tokio::spawn(async move {
        let mut last_target: Option<NaiveDateTime> = None;
        loop {
            if !wait_for_visibility(&mut visible, true).await {
                break;
            }

            let now = Local::now().naive_local();
            let reference = last_target.map_or(now, |target| target.max(now));
            let target = next_occurrence(reference, at);
            let delay = (target - now).to_std().unwrap_or(Duration::ZERO);
            debug!(strategy = %strategy.name, ?delay, "scheduled timed prefetch");

            tokio::select! {
                _ = scheduler.sleep(delay) => {
                    last_target = Some(target);
                    inner.execute_gated(&strategy, "scheduled").await;
                }
                still_open = wait_for_visibility(&mut visible, false) => {
                    if !still_open {
                        break;
                    }
                    debug!(strategy = %strategy.name, "page hidden, timed prefetch paused");
                }
            }
        }
    }))
}

/// Runs `strategy` once during the next host-reported idle period, or after
/// the fallback delay when the host cannot report idleness.
pub(crate) fn schedule_when_idle(
    inner: std::sync::Arc<ManagerInner>,
    strategy: PrefetchStrategy,
) -> TaskHandle {
    let env = inner.client.env().clone();

    if !env.idle_supported() {
        let delay = inner.config.idle_fallback_delay;
        let scheduler = inner.client.scheduler();
        debug!(strategy = %strategy.name, ?delay, "idle detection unavailable, using fallback delay");
        let task = async move {
            inner.execute_gated(&strategy, "idle").await;
        };
        return scheduler.schedule(delay, Box::pin(task));
    }

    let mut events = env.subscribe();
    TaskHandle::new(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HostEvent::Idle) => {
                    inner.execute_gated(&strategy, "idle").await;
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }))
}
