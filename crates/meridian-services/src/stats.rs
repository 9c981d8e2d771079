//! Network stats — protocol counters and the read-only snapshot the
//! dashboard polls.
//!
//! Counters are bumped by the RPC client and the request handler as messages
//! move; everything else in [`NetworkStats`] is derived at call time from the
//! routing table, content store and scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use meridian_core::{MessageKind, NodeId};

use crate::content::ContentStore;
use crate::routing::RoutingTable;
use crate::transfer::TransferScheduler;

fn slot(kind: MessageKind) -> usize {
    MessageKind::ALL.iter().position(|k| *k == kind).unwrap_or(0)
}

#[derive(Default)]
pub struct TrafficCounters {
    sent: [AtomicU64; 7],
    received: [AtomicU64; 7],
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    lookups: AtomicU64,
    lookups_failed: AtomicU64,
    stores_received: AtomicU64,
    /// Peers that sent us a request, with when they last did.
    inbound: DashMap<NodeId, Instant>,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, kind: MessageKind) {
        self.sent[slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, kind: MessageKind) {
        self.received[slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.sent[slot(kind)].load(Ordering::Relaxed)
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.received[slot(kind)].load(Ordering::Relaxed)
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_lookup(&self, found: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if !found {
            self.lookups_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn record_store_received(&self) {
        self.stores_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound(&self, peer: NodeId, now: Instant) {
        self.inbound.insert(peer, now);
    }

    /// Distinct peers that sent a request within `window`. Older entries are
    /// forgotten.
    pub fn inbound_peers(&self, window: Duration, now: Instant) -> usize {
        self.inbound
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        self.inbound.len()
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MessageCount {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub total: usize,
    pub active: usize,
    pub average_rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthStats {
    pub download_bps: u64,
    pub upload_bps: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub outgoing: usize,
    pub incoming: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentStats {
    pub known: usize,
    pub local: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub node_id: NodeId,
    pub uptime_secs: u64,
    pub peers: PeerStats,
    pub bandwidth: BandwidthStats,
    pub connections: ConnectionStats,
    /// Keyed by request type name (`PING`, `FIND_NODE`, ...).
    pub messages: BTreeMap<&'static str, MessageCount>,
    pub lookups: u64,
    pub lookups_failed: u64,
    pub stores_sent: u64,
    pub stores_received: u64,
    pub sessions: BTreeMap<&'static str, usize>,
    pub content: ContentStats,
}

/// Window for counting a peer as an incoming connection.
pub const INBOUND_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct StatsAggregator {
    routing: Arc<RoutingTable>,
    content: Arc<ContentStore>,
    scheduler: Arc<TransferScheduler>,
    traffic: Arc<TrafficCounters>,
    started: Instant,
    active_window: Duration,
}

impl StatsAggregator {
    pub fn new(
        routing: Arc<RoutingTable>,
        content: Arc<ContentStore>,
        scheduler: Arc<TransferScheduler>,
        traffic: Arc<TrafficCounters>,
        active_window: Duration,
    ) -> Self {
        Self {
            routing,
            content,
            scheduler,
            traffic,
            started: Instant::now(),
            active_window,
        }
    }

    pub fn snapshot(&self) -> NetworkStats {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> NetworkStats {
        let totals = self.scheduler.totals(now);
        let t = &self.traffic;

        let messages = MessageKind::ALL
            .iter()
            .filter(|k| **k != MessageKind::Error)
            .map(|k| {
                (
                    k.name(),
                    MessageCount {
                        sent: t.sent(*k),
                        received: t.received(*k),
                    },
                )
            })
            .collect();

        NetworkStats {
            node_id: self.routing.local_id(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            peers: PeerStats {
                total: self.routing.len(),
                active: self.routing.active_count(self.active_window),
                average_rtt_ms: self.routing.average_rtt().map(|d| d.as_millis() as u64),
            },
            bandwidth: BandwidthStats {
                download_bps: totals.download_bps,
                upload_bps: totals.upload_bps,
                bytes_in: t.bytes_in.load(Ordering::Relaxed),
                bytes_out: t.bytes_out.load(Ordering::Relaxed),
            },
            connections: ConnectionStats {
                outgoing: totals.outgoing_peers,
                incoming: t.inbound_peers(INBOUND_WINDOW, now),
            },
            messages,
            lookups: t.lookups(),
            lookups_failed: t.lookups_failed.load(Ordering::Relaxed),
            stores_sent: t.sent(MessageKind::Store),
            stores_received: t.stores_received.load(Ordering::Relaxed),
            sessions: totals.by_state.into_iter().collect(),
            content: ContentStats {
                known: self.content.known_count(),
                local: self.content.local_hashes().len(),
            },
        }
    }
}
