//! Cache Store Module
//!
//! Main cache engine: key → entry map with TTL/staleness, subscriber counts,
//! prefix invalidation and change notification.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::key::matches_prefix;
use crate::cache::{CacheEntry, CacheStats, EntryOptions, EntryState, MAX_KEY_LENGTH};
use crate::error::{CacheError, Result};

/// Buffered change notifications per receiver before it lags.
const EVENT_CAPACITY: usize = 256;

// == Cache Event ==
/// Change notification broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A value was written
    Updated { key: String },
    /// An entry was marked expired
    Invalidated { key: String },
    /// An entry was deleted or evicted
    Removed { key: String },
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Updated { key }
            | CacheEvent::Invalidated { key }
            | CacheEvent::Removed { key } => key,
        }
    }
}

// == Cache Read ==
/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub value: Value,
    pub state: EntryState,
    pub age: Duration,
    pub write_seq: u64,
}

// == Cache Store ==
/// Main cache storage with TTL, staleness and capacity eviction.
#[derive(Debug)]
pub struct CacheStore {
    /// Key-entry storage
    entries: HashMap<String, CacheEntry>,
    /// Active consumers per key, tracked even before an entry exists
    subscribers: HashMap<String, usize>,
    /// Performance statistics
    stats: CacheStats,
    /// Maximum number of entries allowed
    max_entries: usize,
    /// Lifetime used when a write carries no options
    defaults: EntryOptions,
    /// Monotonic write counter
    write_seq: u64,
    events: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a new CacheStore with specified capacity and default lifetimes.
    ///
    /// # Arguments
    /// * `max_entries` - Maximum number of entries the cache can hold
    /// * `defaults` - TTL and stale time for writes without explicit options
    pub fn new(max_entries: usize, defaults: EntryOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: HashMap::new(),
            subscribers: HashMap::new(),
            stats: CacheStats::new(),
            max_entries,
            defaults: EntryOptions::new(defaults.ttl, defaults.stale_time),
            write_seq: 0,
            events,
        }
    }

    /// Default lifetime applied to writes without options.
    pub fn defaults(&self) -> EntryOptions {
        self.defaults
    }

    /// Subscribes to change notifications.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // == Set ==
    /// Stores a value, replacing any previous entry and clearing invalidation.
    ///
    /// If the cache is at capacity, the least recently accessed entry without
    /// subscribers is evicted first.
    ///
    /// # Returns
    /// The write sequence number assigned to the entry.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: Value,
        options: Option<EntryOptions>,
    ) -> Result<u64> {
        let key = key.into();
        validate_key(&key)?;

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            let evicted = self.evict_least_recent().ok_or_else(|| {
                CacheError::CacheFull(format!(
                    "all {} entries have active subscribers",
                    self.entries.len()
                ))
            })?;
            debug!(key = %evicted, "evicted least recently used entry");
        }

        self.write_seq += 1;
        let entry = CacheEntry::new(value, options.unwrap_or(self.defaults), self.write_seq);
        self.entries.insert(key.clone(), entry);
        self.stats.set_total_entries(self.entries.len());
        self.notify(CacheEvent::Updated { key });

        Ok(self.write_seq)
    }

    // == Get ==
    /// Looks up a value and records a hit or miss.
    ///
    /// Expired entries are still returned (their data is servable while a
    /// refetch runs) but count as misses. `None` is a plain cache miss.
    pub fn get(&mut self, key: &str) -> Option<CacheRead> {
        let read = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                Some(CacheRead {
                    value: entry.value.clone(),
                    state: entry.state(),
                    age: entry.age(),
                    write_seq: entry.write_seq,
                })
            }
            None => None,
        };

        match &read {
            Some(hit) if hit.state != EntryState::Expired => self.stats.record_hit(),
            _ => self.stats.record_miss(),
        }
        read
    }

    /// Reads an entry without touching stats or access order.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Current freshness of a key, `None` if absent.
    pub fn state(&self, key: &str) -> Option<EntryState> {
        self.entries.get(key).map(CacheEntry::state)
    }

    /// Write sequence of the entry, 0 if absent.
    pub fn entry_seq(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.write_seq)
    }

    /// Latest write sequence handed out by this store.
    pub fn current_seq(&self) -> u64 {
        self.write_seq
    }

    // == Has ==
    /// Returns true if a non-expired entry exists for the key.
    pub fn has(&self, key: &str) -> bool {
        self.state(key)
            .is_some_and(|state| state != EntryState::Expired)
    }

    // == Delete ==
    /// Removes an entry by key. Returns false if nothing was stored.
    pub fn delete(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.stats.set_total_entries(self.entries.len());
            self.notify(CacheEvent::Removed {
                key: key.to_string(),
            });
            true
        } else {
            false
        }
    }

    // == Invalidate ==
    /// Marks a single entry expired without dropping its data.
    pub fn invalidate(&mut self, key: &str) -> bool {
        let newly = match self.entries.get_mut(key) {
            Some(entry) if !entry.invalidated => {
                entry.invalidated = true;
                true
            }
            _ => false,
        };
        if newly {
            self.stats.record_invalidation();
            self.notify(CacheEvent::Invalidated {
                key: key.to_string(),
            });
        }
        newly
    }

    // == Invalidate Prefix ==
    /// Marks every entry under `prefix` expired.
    ///
    /// Matching is segment-exact and repeated calls are no-ops for entries
    /// that are already invalidated.
    ///
    /// # Returns
    /// Number of entries newly invalidated.
    pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
        let mut invalidated = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if !entry.invalidated && matches_prefix(key, prefix) {
                entry.invalidated = true;
                invalidated.push(key.clone());
            }
        }

        self.stats.record_prefix_invalidation(invalidated.len());
        let count = invalidated.len();
        for key in invalidated {
            self.notify(CacheEvent::Invalidated { key });
        }
        count
    }

    /// Keys currently stored under `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| matches_prefix(key, prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    // == Subscribers ==
    /// Registers an active consumer of `key`.
    pub fn subscribe(&mut self, key: &str) -> usize {
        let count = self.subscribers.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Releases an active consumer of `key`.
    pub fn unsubscribe(&mut self, key: &str) -> usize {
        match self.subscribers.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.subscribers.remove(key);
                0
            }
            None => 0,
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.get(key).copied().unwrap_or(0)
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    // == Cleanup Expired ==
    /// Removes entries past their TTL that nobody is subscribed to.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let evictable: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| entry.is_past_ttl() && self.subscriber_count(key) == 0)
            .map(|(key, _)| key.clone())
            .collect();

        let count = evictable.len();
        for key in evictable {
            self.entries.remove(&key);
            self.stats.record_eviction();
            self.notify(CacheEvent::Removed { key });
        }

        self.stats.set_total_entries(self.entries.len());
        count
    }

    /// Drops every entry and subscriber count.
    pub fn clear(&mut self) {
        let keys: Vec<String> = self.entries.drain().map(|(key, _)| key).collect();
        self.subscribers.clear();
        self.stats.set_total_entries(0);
        for key in keys {
            self.notify(CacheEvent::Removed { key });
        }
    }

    // == Length ==
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .filter(|(key, _)| self.subscriber_count(key) == 0)
            .min_by_key(|(_, entry)| (entry.last_accessed, entry.write_seq))
            .map(|(key, _)| key.clone())?;

        self.entries.remove(&victim);
        self.stats.record_eviction();
        self.notify(CacheEvent::Removed {
            key: victim.clone(),
        });
        Some(victim)
    }

    fn notify(&self, event: CacheEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event);
    }
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}
