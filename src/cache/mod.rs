//! Cache Module
//!
//! Provides the key-addressed store with TTL/staleness tracking, prefix
//! invalidation and change notification.

mod entry;
pub mod key;
mod stats;
mod store;


// Re-export public types
pub use entry::{CacheEntry, EntryOptions, EntryState};
pub use key::{list_key, matches_prefix, query_key, stable_json, KEY_DELIMITER};
pub use stats::CacheStats;
pub use store::{CacheEvent, CacheRead, CacheStore};
pub(crate) use store::validate_key;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
