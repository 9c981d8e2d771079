//! Kademlia routing table — known peers bucketed by XOR distance from the
//! local node.
//!
//! Bucket `i` holds peers whose distance to the local id has its highest set
//! bit at position `i`. Each bucket is kept in least-recently-seen order
//! (front = stalest) and holds at most `k` peers. A new contact arriving at a
//! full bucket evicts the stalest peer.
//!
//! Pure in-memory structure: no network I/O. Callers report what they
//! observed (`record_contact`, `mark_unresponsive`). Mutations lock only the
//! affected bucket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use meridian_core::id::ID_BITS;
use meridian_core::wire::Contact;
use meridian_core::{Distance, Id, NodeId};

/// Weight of the newest RTT sample in the per-peer estimate.
const RTT_SMOOTHING: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Smoothed round-trip estimate. None until a timed exchange completes.
    pub rtt: Option<Duration>,
    /// Consecutive failed requests. Reset on any successful response.
    pub failures: u32,
    /// Request slots the scheduler currently holds on this peer.
    pub connections: u32,
}

impl Peer {
    fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            first_seen: now,
            last_seen: now,
            rtt: None,
            failures: 0,
            connections: 0,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.addr)
    }

    fn observe_rtt(&mut self, sample: Duration) {
        self.rtt = Some(match self.rtt {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - RTT_SMOOTHING) + sample.mul_f64(RTT_SMOOTHING),
        });
    }
}

/// What `record_contact` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    Inserted,
    Refreshed,
    /// Inserted after evicting the least-recently-seen peer of a full bucket.
    Replaced { evicted: NodeId },
    /// The local id, never stored.
    Ignored,
}

/// Peer list row for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub bucket: usize,
    /// XOR distance to the local node, hex.
    pub distance: String,
    pub rtt_ms: Option<u64>,
    pub failures: u32,
    pub connections: u32,
    pub uptime_secs: u64,
    pub idle_secs: u64,
    pub active: bool,
}

pub struct RoutingTable {
    local: NodeId,
    k: usize,
    failure_limit: u32,
    buckets: DashMap<usize, VecDeque<Peer>>,
}

impl RoutingTable {
    pub fn new(local: NodeId, k: usize, failure_limit: u32) -> Self {
        Self {
            local,
            k: k.max(1),
            failure_limit: failure_limit.max(1),
            buckets: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn bucket_of(&self, id: &Id) -> Option<usize> {
        self.local.distance(id).bucket_index()
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Record a message from `id` at `addr`, optionally with a measured RTT.
    pub fn record_contact(&self, id: NodeId, addr: SocketAddr, rtt: Option<Duration>) -> ContactOutcome {
        self.record_contact_at(id, addr, rtt, Instant::now())
    }

    pub fn record_contact_at(
        &self,
        id: NodeId,
        addr: SocketAddr,
        rtt: Option<Duration>,
        now: Instant,
    ) -> ContactOutcome {
        let Some(index) = self.bucket_of(&id) else {
            return ContactOutcome::Ignored;
        };
        let mut bucket = self.buckets.entry(index).or_default();

        if let Some(pos) = bucket.iter().position(|p| p.id == id) {
            if let Some(mut peer) = bucket.remove(pos) {
                peer.addr = addr;
                peer.last_seen = now;
                peer.failures = 0;
                if let Some(sample) = rtt {
                    peer.observe_rtt(sample);
                }
                bucket.push_back(peer);
            }
            return ContactOutcome::Refreshed;
        }

        let mut peer = Peer::new(id, addr, now);
        if let Some(sample) = rtt {
            peer.observe_rtt(sample);
        }

        if bucket.len() < self.k {
            bucket.push_back(peer);
            tracing::debug!(peer = %id, bucket = index, "peer added");
            return ContactOutcome::Inserted;
        }

        let evicted = bucket.pop_front().map(|p| p.id);
        bucket.push_back(peer);
        match evicted {
            Some(evicted) => {
                tracing::debug!(peer = %id, evicted = %evicted, bucket = index, "bucket full, evicted stalest peer");
                ContactOutcome::Replaced { evicted }
            }
            None => ContactOutcome::Inserted,
        }
    }

    /// Count a failed request against `id`. Returns true if the peer was
    /// evicted for reaching the failure limit.
    pub fn mark_unresponsive(&self, id: &NodeId) -> bool {
        let Some(index) = self.bucket_of(id) else {
            return false;
        };
        let Some(mut bucket) = self.buckets.get_mut(&index) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|p| p.id == *id) else {
            return false;
        };
        bucket[pos].failures += 1;
        if bucket[pos].failures >= self.failure_limit {
            bucket.remove(pos);
            tracing::info!(peer = %id, limit = self.failure_limit, "peer evicted after consecutive failures");
            true
        } else {
            tracing::debug!(peer = %id, failures = bucket[pos].failures, "peer unresponsive");
            false
        }
    }

    /// Evict peers not seen within `timeout`. Returns the evicted ids.
    pub fn sweep_inactive(&self, timeout: Duration) -> Vec<NodeId> {
        self.sweep_inactive_at(timeout, Instant::now())
    }

    pub fn sweep_inactive_at(&self, timeout: Duration, now: Instant) -> Vec<NodeId> {
        let mut evicted = Vec::new();
        for mut bucket in self.buckets.iter_mut() {
            bucket.retain(|p| {
                let keep = now.saturating_duration_since(p.last_seen) < timeout;
                if !keep {
                    evicted.push(p.id);
                }
                keep
            });
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "swept inactive peers");
        }
        evicted
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        let Some(index) = self.bucket_of(id) else {
            return false;
        };
        self.buckets
            .get_mut(&index)
            .map(|mut bucket| {
                let before = bucket.len();
                bucket.retain(|p| p.id != *id);
                bucket.len() != before
            })
            .unwrap_or(false)
    }

    /// Record how many request slots the scheduler holds on `id`.
    pub fn set_connections(&self, id: &NodeId, connections: u32) {
        self.with_peer_mut(id, |p| p.connections = connections);
    }

    fn with_peer_mut(&self, id: &NodeId, f: impl FnOnce(&mut Peer)) {
        if let Some(index) = self.bucket_of(id) {
            if let Some(mut bucket) = self.buckets.get_mut(&index) {
                if let Some(peer) = bucket.iter_mut().find(|p| p.id == *id) {
                    f(peer);
                }
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn get(&self, id: &NodeId) -> Option<Peer> {
        let index = self.bucket_of(id)?;
        let bucket = self.buckets.get(&index)?;
        bucket.iter().find(|p| p.id == *id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn rtt(&self, id: &NodeId) -> Option<Duration> {
        self.get(id).and_then(|p| p.rtt)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` peers closest to `target`, ascending by XOR distance.
    ///
    /// Starts at the bucket the target falls in, then widens: every bucket
    /// below it (all at the same distance band from the target), then each
    /// bucket above it in turn, stopping once enough candidates are in hand.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<Peer> {
        if count == 0 {
            return Vec::new();
        }
        let mut found: Vec<Peer> = Vec::new();
        let take = |found: &mut Vec<Peer>, index: usize| {
            if let Some(bucket) = self.buckets.get(&index) {
                found.extend(bucket.iter().cloned());
            }
        };

        match self.bucket_of(target) {
            Some(b) => {
                take(&mut found, b);
                if found.len() < count {
                    for i in 0..b {
                        take(&mut found, i);
                    }
                }
                for i in (b + 1)..ID_BITS {
                    if found.len() >= count {
                        break;
                    }
                    take(&mut found, i);
                }
            }
            None => {
                for i in 0..ID_BITS {
                    if found.len() >= count {
                        break;
                    }
                    take(&mut found, i);
                }
            }
        }

        found.sort_by_key(|p| p.id.distance(target));
        found.truncate(count);
        found
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        peers.sort_by_key(|p| self.local.distance(&p.id));
        peers
    }

    /// Dashboard rows, nearest first.
    pub fn snapshot(&self, active_window: Duration) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        self.all_peers()
            .into_iter()
            .map(|p| {
                let distance: Distance = self.local.distance(&p.id);
                let idle = now.saturating_duration_since(p.last_seen);
                PeerSnapshot {
                    id: p.id,
                    addr: p.addr,
                    bucket: distance.bucket_index().unwrap_or(0),
                    distance: hex::encode(distance.as_bytes()),
                    rtt_ms: p.rtt.map(|d| d.as_millis() as u64),
                    failures: p.failures,
                    connections: p.connections,
                    uptime_secs: now.saturating_duration_since(p.first_seen).as_secs(),
                    idle_secs: idle.as_secs(),
                    active: p.failures == 0 && idle < active_window,
                }
            })
            .collect()
    }

    /// Peers with no outstanding failures seen within `window`.
    pub fn active_count(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.buckets
            .iter()
            .map(|b| {
                b.iter()
                    .filter(|p| p.failures == 0 && now.saturating_duration_since(p.last_seen) < window)
                    .count()
            })
            .sum()
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().filter_map(|p| p.rtt).collect::<Vec<_>>())
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table(k: usize) -> RoutingTable {
        RoutingTable::new(Id::ZERO, k, 3)
    }

    #[test]
    fn find_closest_orders_by_distance() {
        let rt = table(20);
        let (a, b, c) = (Id::from_low_u64(0b0001), Id::from_low_u64(0b0110), Id::from_low_u64(0b1111));
        rt.record_contact(c, addr(3), None);
        rt.record_contact(a, addr(1), None);
        rt.record_contact(b, addr(2), None);

        let ids: Vec<_> = rt.find_closest(&Id::ZERO, 2).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn find_closest_returns_exact_match_first() {
        let rt = table(20);
        let ids: Vec<Id> = (1..40u64).map(Id::from_low_u64).collect();
        for (i, id) in ids.iter().enumerate() {
            rt.record_contact(*id, addr(1000 + i as u16), None);
        }
        for id in &ids {
            if rt.contains(id) {
                assert_eq!(rt.find_closest(id, 1)[0].id, *id);
            }
        }
    }

    #[test]
    fn find_closest_widens_to_higher_buckets() {
        let rt = table(20);
        let near = Id::from_low_u64(0b10);
        let far = Id::from_low_u64(0b1000_0000);
        rt.record_contact(near, addr(1), None);
        rt.record_contact(far, addr(2), None);

        let found = rt.find_closest(&Id::from_low_u64(0b11), 5);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, near);
        assert_eq!(found[1].id, far);
    }

    #[test]
    fn local_id_is_ignored() {
        let rt = table(20);
        assert_eq!(rt.record_contact(Id::ZERO, addr(1), None), ContactOutcome::Ignored);
        assert!(rt.is_empty());
    }

    #[test]
    fn full_bucket_evicts_least_recently_seen() {
        let rt = table(2);
        // 4, 5, 6 all land in bucket 2.
        let (a, b, c) = (Id::from_low_u64(4), Id::from_low_u64(5), Id::from_low_u64(6));
        let t0 = Instant::now();
        rt.record_contact_at(a, addr(1), None, t0);
        rt.record_contact_at(b, addr(2), None, t0 + Duration::from_secs(1));
        // refresh a so b becomes stalest
        assert_eq!(
            rt.record_contact_at(a, addr(1), None, t0 + Duration::from_secs(2)),
            ContactOutcome::Refreshed
        );
        let outcome = rt.record_contact_at(c, addr(3), None, t0 + Duration::from_secs(3));
        assert_eq!(outcome, ContactOutcome::Replaced { evicted: b });
        assert!(rt.contains(&a));
        assert!(rt.contains(&c));
        assert!(!rt.contains(&b));
    }

    #[test]
    fn eviction_after_failure_limit_and_reset_on_success() {
        let rt = table(20);
        let p = Id::from_low_u64(9);
        rt.record_contact(p, addr(1), None);

        assert!(!rt.mark_unresponsive(&p));
        assert!(!rt.mark_unresponsive(&p));
        rt.record_contact(p, addr(1), None);
        assert_eq!(rt.get(&p).unwrap().failures, 0);

        assert!(!rt.mark_unresponsive(&p));
        assert!(!rt.mark_unresponsive(&p));
        assert!(rt.mark_unresponsive(&p));
        assert!(!rt.contains(&p));
    }

    #[test]
    fn sweep_removes_stale_peers() {
        let rt = table(20);
        let t0 = Instant::now();
        rt.record_contact_at(Id::from_low_u64(1), addr(1), None, t0);
        rt.record_contact_at(Id::from_low_u64(2), addr(2), None, t0 + Duration::from_secs(100));

        let evicted = rt.sweep_inactive_at(Duration::from_secs(60), t0 + Duration::from_secs(120));
        assert_eq!(evicted, vec![Id::from_low_u64(1)]);
        assert_eq!(rt.len(), 1);
    }

    #[test]
    fn rtt_is_smoothed() {
        let rt = table(20);
        let p = Id::from_low_u64(3);
        rt.record_contact(p, addr(1), Some(Duration::from_millis(100)));
        rt.record_contact(p, addr(1), Some(Duration::from_millis(200)));
        let rtt = rt.rtt(&p).unwrap().as_millis();
        assert!((129..=130).contains(&rtt), "rtt {rtt}");
    }

    #[test]
    fn snapshot_reports_bucket_and_connections() {
        let rt = table(20);
        let p = Id::from_low_u64(6);
        rt.record_contact(p, addr(1), None);
        rt.set_connections(&p, 2);

        let rows = rt.snapshot(Duration::from_secs(120));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket, 2);
        assert_eq!(rows[0].connections, 2);
        assert!(rows[0].active);
        assert_eq!(rt.active_count(Duration::from_secs(120)), 1);
    }
}
