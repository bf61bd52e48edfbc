//! Background Tasks Module
//!
//! Contains background loops owned by a [`crate::QueryClient`].
//!
//! # Tasks
//! - GC: Removes expired, unsubscribed cache entries at configured intervals
//! - Periodic sync: Refetches a key on an interval while the page is visible

mod cleanup;
mod sync;

pub use cleanup::spawn_cleanup_task;
pub use sync::spawn_periodic_sync;
