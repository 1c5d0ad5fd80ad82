//! Host status events pushed to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::capability::{CapabilityKind, Scope};
use crate::id::ExtensionId;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle and security events observable by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    ExtensionLoaded {
        identity: ExtensionId,
        extension: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    ExtensionFailed {
        extension: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    ExtensionUnloaded {
        identity: ExtensionId,
        extension: String,
        timestamp: DateTime<Utc>,
    },
    CapabilityRevoked {
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<Scope>,
        count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl HostEvent {
    /// Manifest id or identity the event is about, for display.
    pub fn subject(&self) -> String {
        match self {
            Self::ExtensionLoaded { extension, .. }
            | Self::ExtensionFailed { extension, .. }
            | Self::ExtensionUnloaded { extension, .. } => extension.clone(),
            Self::CapabilityRevoked { identity, .. } => identity.to_string(),
        }
    }
}

/// Broadcast fan-out of [`HostEvent`]s.
///
/// Publishing never blocks and never fails; events sent while nobody is
/// subscribed are dropped, and slow subscribers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: HostEvent) {
        // No receivers is not an error for the host.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
