//! Iterative Kademlia lookup.
//!
//! Each round queries up to α not-yet-queried candidates from the shortlist
//! (the k closest known), concurrently, and waits for all of them before the
//! next round picks its candidates. The lookup converges when a round with at
//! least one response brings no closer node, and ends NOT_FOUND when the
//! shortlist runs dry or the lookup deadline passes.
//!
//! VALUE-mode lookups stop at the first reply that names providers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use meridian_core::wire::Contact;
use meridian_core::{Distance, Id, Manifest, NodeId};

use crate::content::ContentStore;
use crate::events::{EngineEvent, EventBus};
use crate::routing::{ContactOutcome, RoutingTable};
use crate::rpc::{PeerClient, Response, ValueReply};
use crate::stats::TrafficCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupMode {
    Node,
    Value,
}

impl FromStr for LookupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "node" => Ok(LookupMode::Node),
            "value" => Ok(LookupMode::Value),
            other => Err(format!("unknown lookup mode '{other}' (expected node or value)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundReason {
    /// Every candidate was queried or failed.
    Exhausted,
    /// The lookup deadline passed.
    Timeout,
    /// VALUE lookup converged without finding a provider.
    NoProviders,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupOutcome {
    /// NODE lookup converged; closest responsive nodes, nearest first.
    Converged { closest: Vec<Contact> },
    /// VALUE lookup found providers.
    Found {
        providers: Vec<Contact>,
        manifest: Option<Manifest>,
    },
    NotFound {
        reason: NotFoundReason,
        closest: Vec<Contact>,
    },
}

impl LookupOutcome {
    pub fn is_found(&self) -> bool {
        !matches!(self, LookupOutcome::NotFound { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub target: Id,
    pub mode: LookupMode,
    pub rounds: u32,
    pub queried: usize,
    pub elapsed_ms: u64,
    pub outcome: LookupOutcome,
}

/// Lookup parameters.
#[derive(Debug, Clone, Copy)]
pub struct LookupConfig {
    pub k: usize,
    pub alpha: usize,
    pub deadline: Duration,
}

/// Record a successful exchange with a peer and announce table changes.
pub(crate) fn record_peer(
    routing: &RoutingTable,
    events: &EventBus,
    id: NodeId,
    addr: SocketAddr,
    rtt: Option<Duration>,
) {
    match routing.record_contact(id, addr, rtt) {
        ContactOutcome::Inserted => events.publish(EngineEvent::PeerAdded { peer: id, addr }),
        ContactOutcome::Replaced { evicted } => {
            events.publish(EngineEvent::PeerEvicted { peer: evicted });
            events.publish(EngineEvent::PeerAdded { peer: id, addr });
        }
        ContactOutcome::Refreshed | ContactOutcome::Ignored => {}
    }
}

/// Count a failed request against a peer.
pub(crate) fn record_failure(routing: &RoutingTable, events: &EventBus, id: &NodeId) {
    if routing.mark_unresponsive(id) {
        events.publish(EngineEvent::PeerEvicted { peer: *id });
    }
}

enum Answer {
    Nodes(Vec<Contact>),
    Value(ValueReply),
}

#[derive(Clone)]
pub struct Lookup {
    routing: Arc<RoutingTable>,
    content: Arc<ContentStore>,
    client: PeerClient,
    traffic: Arc<TrafficCounters>,
    events: EventBus,
    config: LookupConfig,
}

impl Lookup {
    pub fn new(
        routing: Arc<RoutingTable>,
        content: Arc<ContentStore>,
        client: PeerClient,
        traffic: Arc<TrafficCounters>,
        events: EventBus,
        config: LookupConfig,
    ) -> Self {
        Self {
            routing,
            content,
            client,
            traffic,
            events,
            config,
        }
    }

    pub fn config(&self) -> LookupConfig {
        self.config
    }

    pub async fn run(&self, target: Id, mode: LookupMode) -> LookupResult {
        let started = tokio::time::Instant::now();
        let deadline = started + self.config.deadline;
        let local = self.routing.local_id();
        let k = self.config.k.max(1);
        let alpha = self.config.alpha.max(1);

        let mut shortlist: BTreeSet<(Distance, NodeId)> = BTreeSet::new();
        let mut addrs: HashMap<NodeId, SocketAddr> = HashMap::new();
        for peer in self.routing.find_closest(&target, k) {
            shortlist.insert((target.distance(&peer.id), peer.id));
            addrs.insert(peer.id, peer.addr);
        }

        let mut queried: HashSet<NodeId> = HashSet::from([local]);
        let mut responded: BTreeSet<(Distance, NodeId)> = BTreeSet::new();
        let mut rounds = 0u32;

        tracing::debug!(target = %target, mode = ?mode, seeds = shortlist.len(), "lookup started");

        let outcome = 'lookup: loop {
            let batch: Vec<Contact> = shortlist
                .iter()
                .filter(|(_, id)| !queried.contains(id))
                .take(alpha)
                .filter_map(|(_, id)| addrs.get(id).map(|addr| Contact::new(*id, *addr)))
                .collect();

            if batch.is_empty() {
                break self.finish(mode, &responded, &addrs, NotFoundReason::Exhausted);
            }
            rounds += 1;
            let best_before = shortlist.first().map(|(d, _)| *d);

            let mut tasks = JoinSet::new();
            for contact in batch {
                queried.insert(contact.id);
                let client = self.client.clone();
                tasks.spawn(async move {
                    let result = match mode {
                        LookupMode::Node => client
                            .find_node(contact.addr, target)
                            .await
                            .map(|r| Response { from: r.from, rtt: r.rtt, body: Answer::Nodes(r.body) }),
                        LookupMode::Value => client
                            .find_value(contact.addr, target)
                            .await
                            .map(|r| Response { from: r.from, rtt: r.rtt, body: Answer::Value(r.body) }),
                    };
                    (contact, result)
                });
            }

            let mut any_response = false;
            loop {
                let next = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(Some(joined)) => joined,
                    Ok(None) => break,
                    Err(_) => {
                        // dropping the set aborts the queries still out
                        tracing::debug!(target = %target, rounds, "lookup deadline passed");
                        break 'lookup self.finish(mode, &responded, &addrs, NotFoundReason::Timeout);
                    }
                };
                let Ok((contact, result)) = next else {
                    continue;
                };

                match result {
                    Ok(reply) => {
                        any_response = true;
                        record_peer(&self.routing, &self.events, reply.from, contact.addr, Some(reply.rtt));
                        responded.insert((target.distance(&reply.from), reply.from));
                        addrs.insert(reply.from, contact.addr);

                        let closer = match reply.body {
                            Answer::Nodes(contacts) => contacts,
                            Answer::Value(value) => {
                                if let Some(found) = self.accept_value(target, value.clone()) {
                                    break 'lookup found;
                                }
                                value.closer
                            }
                        };
                        tracing::trace!(peer = %reply.from, returned = closer.len(), "lookup reply");
                        for c in closer {
                            if c.id == local || queried.contains(&c.id) {
                                continue;
                            }
                            addrs.entry(c.id).or_insert(c.addr);
                            shortlist.insert((target.distance(&c.id), c.id));
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %contact.id, error = %e, "lookup query failed");
                        shortlist.remove(&(target.distance(&contact.id), contact.id));
                        if e.counts_against_peer() {
                            record_failure(&self.routing, &self.events, &contact.id);
                        }
                    }
                }
            }

            while shortlist.len() > k {
                shortlist.pop_last();
            }

            let best_after = shortlist.first().map(|(d, _)| *d);
            let improved = match (best_before, best_after) {
                (Some(before), Some(after)) => after < before,
                (None, Some(_)) => true,
                _ => false,
            };
            if any_response && !improved {
                break self.finish(mode, &responded, &addrs, NotFoundReason::NoProviders);
            }
        };

        self.traffic.record_lookup(outcome.is_found());
        let elapsed = started.elapsed();
        match &outcome {
            LookupOutcome::NotFound { reason, .. } => {
                tracing::info!(target = %target, mode = ?mode, rounds, reason = ?reason, "lookup not found")
            }
            _ => tracing::debug!(target = %target, mode = ?mode, rounds, elapsed_ms = elapsed.as_millis() as u64, "lookup finished"),
        }

        LookupResult {
            target,
            mode,
            rounds,
            queried: queried.len() - 1,
            elapsed_ms: elapsed.as_millis() as u64,
            outcome,
        }
    }

    /// Providers from a VALUE reply are recorded with the default TTL.
    fn accept_value(&self, hash: Id, value: ValueReply) -> Option<LookupOutcome> {
        let local = self.routing.local_id();
        let providers: Vec<Contact> = value.providers.into_iter().filter(|c| c.id != local).collect();
        if providers.is_empty() {
            return None;
        }
        for provider in &providers {
            self.content.record_provider(hash, *provider, self.content.default_ttl());
        }
        let manifest = value.manifest.filter(|m| m.content_hash() == hash);
        if let Some(m) = &manifest {
            self.content.set_manifest(hash, m.clone());
        }
        Some(LookupOutcome::Found { providers, manifest })
    }

    /// Outcome once the shortlist is settled.
    fn finish(
        &self,
        mode: LookupMode,
        responded: &BTreeSet<(Distance, NodeId)>,
        addrs: &HashMap<NodeId, SocketAddr>,
        reason: NotFoundReason,
    ) -> LookupOutcome {
        let closest: Vec<Contact> = responded
            .iter()
            .take(self.config.k.max(1))
            .filter_map(|(_, id)| addrs.get(id).map(|addr| Contact::new(*id, *addr)))
            .collect();
        match (mode, reason) {
            (_, NotFoundReason::Timeout) => LookupOutcome::NotFound { reason, closest },
            (LookupMode::Node, _) if !closest.is_empty() => LookupOutcome::Converged { closest },
            (LookupMode::Node, _) => LookupOutcome::NotFound { reason: NotFoundReason::Exhausted, closest },
            (LookupMode::Value, _) if closest.is_empty() => LookupOutcome::NotFound { reason: NotFoundReason::Exhausted, closest },
            (LookupMode::Value, _) => LookupOutcome::NotFound { reason: NotFoundReason::NoProviders, closest },
        }
    }
}
