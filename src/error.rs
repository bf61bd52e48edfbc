//! Error types for the query cache
//!
//! Provides unified error handling using thiserror. Collaborator failures
//! (fetchers, mutation functions) arrive as `anyhow::Error` and are shared
//! behind an `Arc` so every waiter of a single-flight fetch sees the same cause.

use std::sync::Arc;

use thiserror::Error;

/// A collaborator failure shared between all observers of one operation.
pub type SharedError = Arc<anyhow::Error>;

// == Cache Error Enum ==
/// Unified error type for the query cache.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// A fetch attempt failed and no retries were configured
    #[error("Fetch failed for '{key}': {cause}")]
    Fetch { key: String, cause: SharedError },

    /// Every allowed attempt failed
    #[error("Retries exhausted for '{key}' after {attempts} attempts: {cause}")]
    RetryExhausted {
        key: String,
        attempts: u32,
        cause: SharedError,
    },

    /// A mutation function rejected
    #[error("Mutation failed: {cause}")]
    Mutation { cause: SharedError },

    /// The cached value could not be turned into the requested type
    #[error("Failed to decode value for '{key}': {message}")]
    Decode { key: String, message: String },

    /// Key is empty or too long
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Every entry is subscribed, nothing can be evicted
    #[error("Cache full: {0}")]
    CacheFull(String),

    /// Pending retries were dropped because nobody is waiting any more
    #[error("Fetch for '{key}' abandoned")]
    Cancelled { key: String },

    /// Internal failure (task panicked, runtime shut down)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Number of attempts consumed before the error became terminal.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            CacheError::Fetch { .. } => Some(1),
            CacheError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the query cache.
pub type Result<T> = std::result::Result<T, CacheError>;
