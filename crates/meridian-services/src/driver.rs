//! Transfer driver — the periodic step that turns scheduler decisions into
//! network requests and feeds the results back.
//!
//! Each tick withdraws expired requests, asks the scheduler for work under
//! the current limits, spawns one task per request, and starts provider
//! searches for sessions that have nobody to ask.

use std::time::Instant;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use meridian_core::wire::Contact;
use meridian_core::{ContentHash, EngineError, NodeId};

use crate::engine::{now, Shared};
use crate::lookup::{record_failure, record_peer};
use crate::transfer::{ChunkOutcome, SelectionView, SessionId, Work, WorkLimits};
use crate::transport::RpcError;

/// Peers as the scheduler sees them: known remote providers and routing RTTs.
struct NetworkView<'a> {
    shared: &'a Shared,
}

impl SelectionView for NetworkView<'_> {
    fn providers(&self, hash: &ContentHash) -> Vec<Contact> {
        self.shared.content.remote_providers_of(hash)
    }

    fn rtt(&self, peer: &NodeId) -> Option<std::time::Duration> {
        self.shared.routing.rtt(peer)
    }
}

pub struct TransferDriver {
    shared: Shared,
    shutdown: broadcast::Receiver<()>,
}

impl TransferDriver {
    pub(crate) fn new(shared: Shared, shutdown: broadcast::Receiver<()>) -> Self {
        Self { shared, shutdown }
    }

    pub async fn run(mut self) {
        let transfer = &self.shared.config.transfer;
        let refresh = transfer.provider_refresh();
        let mut interval = tokio::time::interval(transfer.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_refresh = now();

        info!("transfer driver started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("transfer driver shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let now = now();
                    Self::step(&self.shared, now);
                    if now.saturating_duration_since(last_refresh) >= refresh {
                        refresh_providers(&self.shared);
                        last_refresh = now;
                    }
                }
            }
        }
    }

    /// One scheduling pass.
    pub(crate) fn step(shared: &Shared, now: Instant) {
        let scheduler = &shared.scheduler;

        for (session, index, peer) in scheduler.check_timeouts(now) {
            debug!(session = %session, index = ?index, peer = %peer, "request expired");
            record_failure(&shared.routing, &shared.events, &peer);
        }

        let view = NetworkView { shared };
        let mut admit = |bytes: u64| shared.limits.download.try_take_at(bytes, now);
        let assignments = scheduler.next_work(
            &view,
            WorkLimits {
                max_connections: shared.limits.max_connections(),
                admit_bytes: &mut admit,
            },
            now,
        );

        for work in assignments.work {
            spawn_work(shared, work);
        }
        for (session, hash) in assignments.starving {
            search_providers(shared, session, hash);
        }

        for (peer, slots) in scheduler.slot_counts() {
            shared.routing.set_connections(&peer, slots as u32);
        }
        scheduler.prune_idle_slots();

        let swept = scheduler.sweep_uploads(shared.config.transfer.upload_idle(), now);
        if swept > 0 {
            debug!(swept, "idle uploads removed");
        }
    }
}

fn spawn_work(shared: &Shared, work: Work) {
    let task = {
        let shared = shared.clone();
        let work = work.clone();
        tokio::spawn(async move {
            match work {
                Work::Manifest { session, hash, peer } => fetch_manifest(shared, session, hash, peer).await,
                Work::Chunk { session, hash, index, peer } => fetch_chunk(shared, session, hash, index, peer).await,
            }
        })
    };
    shared.scheduler.attach_abort(&work, task.abort_handle());
}

async fn fetch_manifest(shared: Shared, session: SessionId, hash: ContentHash, peer: Contact) {
    match shared.client.fetch_manifest(peer.addr, hash).await {
        Ok(resp) => {
            record_peer(&shared.routing, &shared.events, resp.from, peer.addr, Some(resp.rtt));
            let local = shared.content.local_chunks(&hash);
            match shared
                .scheduler
                .on_manifest_received(session, peer.id, resp.body.clone(), local)
            {
                Ok(()) => {
                    shared.content.set_manifest(hash, resp.body);
                }
                Err(EngineError::ChunkIntegrityMismatch { .. }) => {
                    record_failure(&shared.routing, &shared.events, &peer.id);
                }
                Err(e) => debug!(session = %session, error = %e, "manifest discarded"),
            }
        }
        Err(e) => request_failed(&shared, session, hash, None, peer, e),
    }
}

async fn fetch_chunk(shared: Shared, session: SessionId, hash: ContentHash, index: u32, peer: Contact) {
    let resp = match shared.client.fetch_chunk(peer.addr, hash, index).await {
        Ok(resp) => resp,
        Err(e) => return request_failed(&shared, session, hash, Some(index), peer, e),
    };
    record_peer(&shared.routing, &shared.events, resp.from, peer.addr, Some(resp.rtt));

    // Verified chunks hit the cache before the session counts them.
    if shared.scheduler.chunk_is_valid(session, index, &resp.body) {
        if let Err(e) = shared.cache.put(&hash, index, &resp.body) {
            warn!(session = %session, index, error = %e, "failed to cache chunk");
            shared
                .scheduler
                .on_store_failed(session, index, peer.id, &format!("{e:#}"), now());
            return;
        }
        shared.content.mark_chunk(&hash, index);
    }

    match shared
        .scheduler
        .on_chunk_received(session, index, &resp.body, peer.id, now())
    {
        Ok(ChunkOutcome::Completed) => {
            info!(session = %session, hash = %hash, "download complete");
            shared.announce_local(hash);
        }
        Ok(_) => {}
        Err(EngineError::ChunkIntegrityMismatch { .. }) => {
            record_failure(&shared.routing, &shared.events, &peer.id);
        }
        // paused, cancelled or dismissed while the request was out
        Err(e) => debug!(session = %session, index, error = %e, "chunk discarded"),
    }
}

fn request_failed(
    shared: &Shared,
    session: SessionId,
    hash: ContentHash,
    index: Option<u32>,
    peer: Contact,
    error: RpcError,
) {
    if error.counts_against_peer() {
        record_failure(&shared.routing, &shared.events, &peer.id);
    }
    if error == RpcError::Unavailable {
        shared.content.remove_provider(&hash, &peer.id);
    }
    shared.scheduler.on_request_failed(session, index, peer.id, &error);
}

/// Look for providers of a session that has none usable.
fn search_providers(shared: &Shared, session: SessionId, hash: ContentHash) {
    if !shared.dht_enabled() {
        let known = shared.content.remote_providers_of(&hash);
        shared.scheduler.on_provider_search(session, &known, now());
        return;
    }
    if !shared.searching.insert(hash) {
        return;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        let providers = shared.find_providers(hash).await;
        shared.searching.remove(&hash);
        shared.scheduler.on_provider_search(session, &providers, now());
    });
}

/// Top up provider records for every active download.
fn refresh_providers(shared: &Shared) {
    if !shared.dht_enabled() {
        return;
    }
    for (_, hash) in shared.scheduler.active_downloads() {
        if !shared.searching.insert(hash) {
            continue;
        }
        let shared = shared.clone();
        tokio::spawn(async move {
            shared.find_providers(hash).await;
            shared.searching.remove(&hash);
        });
    }
}
