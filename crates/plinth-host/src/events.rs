//! Host lifecycle events.
//!
//! Every state change the registry makes is broadcast as a [`HostEvent`].
//! Subscribers that fall behind miss events rather than slowing the host.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::loader::RouteDiagnostic;
use crate::routes::RouteCollision;
use crate::scanner::ArtifactKind;

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Loaded {
        plugin: String,
        generation: u64,
        kind: ArtifactKind,
        routes: usize,
    },
    Unloaded {
        plugin: String,
        generation: u64,
    },
    UnloadPending {
        plugin: String,
        generation: u64,
        inflight: usize,
    },
    UnloadBlocked {
        plugin: String,
        generation: u64,
        reason: String,
    },
    Failed {
        plugin: String,
        reason: String,
    },
    /// A script bundle was replaced in place.
    Swapped {
        plugin: String,
        generation: u64,
    },
    RouteCollision(RouteCollision),
    RouteDropped(RouteDiagnostic),
}

impl HostEvent {
    /// Stable event name, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Loaded { .. } => "loaded",
            HostEvent::Unloaded { .. } => "unloaded",
            HostEvent::UnloadPending { .. } => "unload_pending",
            HostEvent::UnloadBlocked { .. } => "unload_blocked",
            HostEvent::Failed { .. } => "failed",
            HostEvent::Swapped { .. } => "swapped",
            HostEvent::RouteCollision(_) => "route_collision",
            HostEvent::RouteDropped(_) => "route_dropped",
        }
    }

    /// The plugin the event is about. Collisions report the losing plugin.
    pub fn plugin(&self) -> &str {
        match self {
            HostEvent::Loaded { plugin, .. }
            | HostEvent::Unloaded { plugin, .. }
            | HostEvent::UnloadPending { plugin, .. }
            | HostEvent::UnloadBlocked { plugin, .. }
            | HostEvent::Failed { plugin, .. }
            | HostEvent::Swapped { plugin, .. } => plugin,
            HostEvent::RouteCollision(collision) => &collision.loser,
            HostEvent::RouteDropped(diagnostic) => &diagnostic.plugin,
        }
    }
}

/// Outcome of retiring one plugin generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnloadReport {
    Unloaded,
    Pending { inflight: usize },
    Blocked { reason: String },
}

/// Thin wrapper over a broadcast sender that tolerates having no subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn emit(&self, event: HostEvent) {
        tracing::debug!(event = event.name(), plugin = %event.plugin(), "host event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DropReason;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = HostEvent::Loaded {
            plugin: "weather".into(),
            generation: 1,
            kind: ArtifactKind::NativeBinary,
            routes: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "loaded");
        assert_eq!(json["kind"], "native_binary");
        assert_eq!(json["routes"], 2);
        assert_eq!(event.name(), "loaded");
    }

    #[test]
    fn test_newtype_variant_flattens_payload() {
        let event = HostEvent::RouteCollision(RouteCollision {
            method: "GET".into(),
            pattern: "/shared".into(),
            winner: "alpha".into(),
            loser: "beta".into(),
            loser_pattern: "/shared".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "route_collision");
        assert_eq!(json["winner"], "alpha");
        assert_eq!(event.plugin(), "beta");
    }

    #[test]
    fn test_route_dropped_names_plugin() {
        let event = HostEvent::RouteDropped(RouteDiagnostic {
            plugin: "weather".into(),
            method: "GET".into(),
            path: "/weather/now".into(),
            symbol: "missing".into(),
            reason: DropReason::UnresolvedSymbol,
        });
        assert_eq!(event.plugin(), "weather");
        assert_eq!(event.name(), "route_dropped");
    }

    #[test]
    fn test_unload_report_serialization() {
        let json = serde_json::to_value(UnloadReport::Pending { inflight: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "pending", "inflight": 3}));
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(HostEvent::Failed {
            plugin: "weather".into(),
            reason: "boom".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "failed");
    }

    #[test]
    fn test_bus_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(HostEvent::Unloaded {
            plugin: "weather".into(),
            generation: 1,
        });
    }
}
