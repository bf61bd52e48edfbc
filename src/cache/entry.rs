//! Cache Entry Module
//!
//! Defines individual cache entries with TTL and staleness tracking.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

// == Entry State ==
/// Freshness of an entry, derived from its age and invalidation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Younger than its stale time
    Fresh,
    /// Past its stale time, still servable
    Stale,
    /// Past its TTL or explicitly invalidated
    Expired,
}

impl EntryState {
    /// Returns true if a consumer should issue a fetch before trusting the value.
    pub fn needs_refetch(self) -> bool {
        !matches!(self, EntryState::Fresh)
    }
}

// == Entry Options ==
/// Lifetime settings for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    pub ttl: Duration,
    pub stale_time: Duration,
}

impl EntryOptions {
    /// Creates entry options; `stale_time` is clamped so it never exceeds `ttl`.
    pub fn new(ttl: Duration, stale_time: Duration) -> Self {
        Self {
            ttl,
            stale_time: stale_time.min(ttl),
        }
    }
}

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stored value
    pub value: Value,
    /// When the value was written
    pub fetched_at: Instant,
    /// Age after which the entry may be evicted
    pub ttl: Duration,
    /// Age after which the entry is due for revalidation
    pub stale_time: Duration,
    /// Set by invalidation, cleared by the next write
    pub invalidated: bool,
    /// Last read or write, used for capacity eviction
    pub last_accessed: Instant,
    /// Store-wide write sequence number of the last write
    pub write_seq: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry written now.
    pub fn new(value: Value, options: EntryOptions, write_seq: u64) -> Self {
        let now = Instant::now();
        let options = EntryOptions::new(options.ttl, options.stale_time);
        Self {
            value,
            fetched_at: now,
            ttl: options.ttl,
            stale_time: options.stale_time,
            invalidated: false,
            last_accessed: now,
            write_seq,
        }
    }

    // == Age ==
    /// Time elapsed since the value was written.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    // == State ==
    /// Derives the current freshness.
    ///
    /// Boundary condition: an entry turns stale once its age reaches
    /// `stale_time` and expired once it reaches `ttl`.
    pub fn state(&self) -> EntryState {
        let age = self.age();
        if self.invalidated || age >= self.ttl {
            EntryState::Expired
        } else if age >= self.stale_time {
            EntryState::Stale
        } else {
            EntryState::Fresh
        }
    }

    /// Returns true when the entry outlived its TTL.
    pub fn is_past_ttl(&self) -> bool {
        self.age() > self.ttl
    }

    // == Time To Live ==
    /// Returns remaining TTL, zero once the TTL has elapsed.
    pub fn ttl_remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }
}
