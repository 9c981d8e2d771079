//! Engine event stream — state changes pushed to subscribers (the API's SSE
//! endpoint) so clients can update without polling.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::broadcast;

use meridian_core::{ContentHash, NodeId};

use crate::transfer::{Direction, SessionId, SessionState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PeerAdded {
        peer: NodeId,
        addr: SocketAddr,
    },
    PeerEvicted {
        peer: NodeId,
    },
    SessionCreated {
        session: SessionId,
        hash: ContentHash,
        direction: Direction,
    },
    SessionStateChanged {
        session: SessionId,
        hash: ContentHash,
        direction: Direction,
        from: SessionState,
        to: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SessionProgress {
        session: SessionId,
        progress: f64,
        speed_bps: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_secs: Option<u64>,
    },
    SessionCompleted {
        session: SessionId,
        hash: ContentHash,
    },
    ContentAnnounced {
        hash: ContentHash,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PeerAdded { .. } => "peer_added",
            EngineEvent::PeerEvicted { .. } => "peer_evicted",
            EngineEvent::SessionCreated { .. } => "session_created",
            EngineEvent::SessionStateChanged { .. } => "session_state_changed",
            EngineEvent::SessionProgress { .. } => "session_progress",
            EngineEvent::SessionCompleted { .. } => "session_completed",
            EngineEvent::ContentAnnounced { .. } => "content_announced",
        }
    }
}

/// Fan-out of [`EngineEvent`]s. Slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Id;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::PeerEvicted { peer: Id::from_low_u64(1) });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "peer_evicted");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "peer_evicted");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::ContentAnnounced { hash: Id::ZERO });
    }
}
