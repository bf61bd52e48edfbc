//! Host environment signals.
//!
//! The cache never talks to a real browser or OS. Whatever embeds it feeds
//! focus, connectivity, visibility and idle transitions into a
//! [`HostEnvironment`], and tests drive the same handle deterministically.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// Transition reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Focus,
    Blur,
    Online,
    Offline,
    Visible,
    Hidden,
    /// The host has spare capacity for background work
    Idle,
}

/// Effective connection type as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    Cellular2g,
    #[serde(rename = "3g")]
    Cellular3g,
    #[serde(rename = "4g")]
    Cellular4g,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ConnectionType {
    /// Returns true for the types that suppress non-critical prefetching.
    pub fn is_slow(self) -> bool {
        matches!(self, ConnectionType::Slow2g | ConnectionType::Cellular2g)
    }
}

impl FromStr for ConnectionType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => ConnectionType::Slow2g,
            "2g" => ConnectionType::Cellular2g,
            "3g" => ConnectionType::Cellular3g,
            "4g" => ConnectionType::Cellular4g,
            _ => ConnectionType::Unknown,
        })
    }
}

/// Snapshot of network conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub effective_type: ConnectionType,
    /// Downlink estimate in Mbps, `None` if the host cannot tell
    pub downlink_mbps: Option<f64>,
    pub save_data: bool,
    pub online: bool,
}

impl NetworkStatus {
    pub fn new(effective_type: ConnectionType, downlink_mbps: Option<f64>) -> Self {
        Self {
            effective_type,
            downlink_mbps,
            save_data: false,
            online: true,
        }
    }

    pub fn with_save_data(mut self, save_data: bool) -> Self {
        self.save_data = save_data;
        self
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(ConnectionType::Unknown, None)
    }
}

/// Injected source of host signals.
#[derive(Debug)]
pub struct HostEnvironment {
    events: broadcast::Sender<HostEvent>,
    network: watch::Sender<NetworkStatus>,
    visible: watch::Sender<bool>,
    idle_supported: bool,
}

impl HostEnvironment {
    /// Creates an environment that starts visible and online with unknown network.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (network, _) = watch::channel(NetworkStatus::default());
        let (visible, _) = watch::channel(true);
        Self {
            events,
            network,
            visible,
            idle_supported: false,
        }
    }

    /// Declares whether the host reports idle periods via [`HostEvent::Idle`].
    pub fn with_idle_detection(mut self, supported: bool) -> Self {
        self.idle_supported = supported;
        self
    }

    pub fn with_network(self, status: NetworkStatus) -> Self {
        self.network.send_replace(status);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn network(&self) -> NetworkStatus {
        self.network.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.network.borrow().online
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    pub fn watch_visibility(&self) -> watch::Receiver<bool> {
        self.visible.subscribe()
    }

    pub fn idle_supported(&self) -> bool {
        self.idle_supported
    }

    // == Host-side setters ==

    pub fn focus(&self) {
        self.emit(HostEvent::Focus);
    }

    pub fn blur(&self) {
        self.emit(HostEvent::Blur);
    }

    pub fn idle(&self) {
        self.emit(HostEvent::Idle);
    }

    /// Updates connectivity; emits `Online`/`Offline` only on a transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.network.send_if_modified(|status| {
            let changed = status.online != online;
            status.online = online;
            changed
        });
        if changed {
            self.emit(if online {
                HostEvent::Online
            } else {
                HostEvent::Offline
            });
        }
    }

    /// Replaces network conditions; connectivity transitions are emitted too.
    pub fn set_network(&self, status: NetworkStatus) {
        let online = status.online;
        let was_online = self.network.send_replace(status).online;
        if was_online != online {
            self.emit(if online {
                HostEvent::Online
            } else {
                HostEvent::Offline
            });
        }
    }

    /// Updates page visibility; emits `Visible`/`Hidden` only on a transition.
    pub fn set_visible(&self, visible: bool) {
        let previous = self.visible.send_replace(visible);
        if previous != visible {
            self.emit(if visible {
                HostEvent::Visible
            } else {
                HostEvent::Hidden
            });
        }
    }

    fn emit(&self, event: HostEvent) {
        debug!(?event, "host event");
        let _ = self.events.send(event);
    }
}

/// Waits until `visible` reports `wanted`. Returns false once the host is gone.
pub(crate) async fn wait_for_visibility(visible: &mut watch::Receiver<bool>, wanted: bool) -> bool {
    visible.wait_for(|current| *current == wanted).await.is_ok()
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
