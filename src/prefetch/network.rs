//! Network-aware gating.
//!
//! Decides from the host's connection report which priority tiers may run.
//! Critical work always passes.

use serde::Serialize;

use crate::config::PrefetchConfig;
use crate::env::{ConnectionType, NetworkStatus};
use crate::prefetch::Priority;

/// Coarse bandwidth class derived from a [`NetworkStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bandwidth {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkGate {
    min_downlink_mbps: f64,
    high_bandwidth_mbps: f64,
}

impl NetworkGate {
    pub fn new(config: &PrefetchConfig) -> Self {
        Self {
            min_downlink_mbps: config.min_downlink_mbps,
            high_bandwidth_mbps: config.high_bandwidth_mbps,
        }
    }

    /// True when all non-critical prefetching must stop.
    pub fn is_constrained(&self, status: &NetworkStatus) -> bool {
        !status.online
            || status.save_data
            || status.effective_type.is_slow()
            || status
                .downlink_mbps
                .is_some_and(|downlink| downlink < self.min_downlink_mbps)
    }

    pub fn bandwidth(&self, status: &NetworkStatus) -> Bandwidth {
        if self.is_constrained(status) {
            return Bandwidth::Low;
        }
        match status.effective_type {
            ConnectionType::Cellular4g | ConnectionType::Unknown => match status.downlink_mbps {
                Some(downlink) if downlink < self.high_bandwidth_mbps => Bandwidth::Normal,
                _ => Bandwidth::High,
            },
            ConnectionType::Cellular3g => Bandwidth::Normal,
            ConnectionType::Slow2g | ConnectionType::Cellular2g => Bandwidth::Low,
        }
    }

    /// Least severe tier allowed to run.
    pub fn ceiling(&self, status: &NetworkStatus) -> Priority {
        match self.bandwidth(status) {
            Bandwidth::High => Priority::Low,
            Bandwidth::Normal => Priority::Normal,
            Bandwidth::Low => Priority::Critical,
        }
    }

    pub fn allows(&self, priority: Priority, status: &NetworkStatus) -> bool {
        priority == Priority::Critical || priority <= self.ceiling(status)
    }
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new(&PrefetchConfig::default())
    }
}
