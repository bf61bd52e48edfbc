//! Prefetch Module
//!
//! Priority-tiered, network-gated and behavior-predicted background loading.

mod manager;
mod network;
mod predictor;
mod schedule;
mod strategy;

pub use manager::{PrefetchManager, PrefetchStats};
pub use network::{Bandwidth, NetworkGate};
pub use predictor::{BehaviorPredictor, HISTORY_STORAGE_KEY};
pub use schedule::{delay_until, next_occurrence};
pub use strategy::{Action, Condition, PrefetchContext, PrefetchStrategy, Priority};
