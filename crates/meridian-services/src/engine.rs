//! Engine facade — owns the routing table, content store, chunk cache,
//! scheduler and counters, answers inbound protocol requests, and exposes
//! the query and command operations the API serves.
//!
//! Background work (transfer driver, sweeps, republishing) runs in tasks
//! started by [`Engine::start`] and stopped by [`Engine::shutdown`] over a
//! broadcast channel.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashSet;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use meridian_core::config::{LimitsConfig, MeridianConfig};
use meridian_core::manifest::MAX_MANIFEST_CHUNKS;
use meridian_core::wire::{Contact, ErrorCode, Message, MAX_CONTACTS};
use meridian_core::{ContentHash, EngineError, Id, Manifest, NodeId};

use crate::cache::ChunkCache;
use crate::content::{ContentStore, SearchResult};
use crate::driver::TransferDriver;
use crate::events::{EngineEvent, EventBus};
use crate::lookup::{record_peer, Lookup, LookupConfig, LookupMode, LookupOutcome, LookupResult};
use crate::maintenance::Maintenance;
use crate::qos::TokenBucket;
use crate::routing::{PeerSnapshot, RoutingTable};
use crate::rpc::PeerClient;
use crate::stats::{NetworkStats, StatsAggregator, TrafficCounters};
use crate::transfer::{SchedulerConfig, SessionId, SessionSnapshot, TransferScheduler};
use crate::transport::{RequestHandler, Transport};

/// Manifests larger than this are not inlined in VALUE replies.
const MANIFEST_INLINE_CHUNKS: u32 = 512;

/// Engine clock. Follows tokio's clock so paused-time tests drive timeouts.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

// ── Limits ────────────────────────────────────────────────────────────────────

/// Live bandwidth and connection limits, adjustable at runtime.
pub struct Limits {
    pub(crate) download: TokenBucket,
    pub(crate) upload: TokenBucket,
    max_connections: AtomicUsize,
}

impl Limits {
    fn new(config: &LimitsConfig) -> Self {
        Self {
            download: TokenBucket::new(config.max_download_bps),
            upload: TokenBucket::new(config.max_upload_bps),
            max_connections: AtomicUsize::new(config.max_connections as usize),
        }
    }

    pub fn current(&self) -> LimitsConfig {
        LimitsConfig {
            max_download_bps: self.download.rate(),
            max_upload_bps: self.upload.rate(),
            max_connections: u32::try_from(self.max_connections()).unwrap_or(u32::MAX),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }
}

/// Partial limits change. Signed so negative input can be rejected rather
/// than failing to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsUpdate {
    pub max_download_bps: Option<i64>,
    pub max_upload_bps: Option<i64>,
    pub max_connections: Option<i64>,
}

fn non_negative(name: &str, value: Option<i64>) -> Result<Option<u64>, EngineError> {
    match value {
        Some(v) if v < 0 => Err(EngineError::ConfigurationInvalid(format!(
            "{name} must not be negative (got {v})"
        ))),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

/// Result of sharing local content.
#[derive(Debug, Clone, Serialize)]
pub struct SharedContent {
    pub hash: ContentHash,
    pub name: String,
    pub size: u64,
    pub chunks: u32,
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// Everything the background tasks and request handling need.
#[derive(Clone)]
pub(crate) struct Shared {
    pub local: Contact,
    pub config: Arc<MeridianConfig>,
    pub routing: Arc<RoutingTable>,
    pub content: Arc<ContentStore>,
    pub cache: ChunkCache,
    pub scheduler: Arc<TransferScheduler>,
    pub traffic: Arc<TrafficCounters>,
    pub client: PeerClient,
    pub lookup: Lookup,
    pub events: EventBus,
    pub limits: Arc<Limits>,
    /// Content with a provider search in flight.
    pub searching: Arc<DashSet<ContentHash>>,
}

impl Shared {
    pub fn dht_enabled(&self) -> bool {
        self.config.dht.enabled
    }

    /// VALUE lookup, returning the remote providers now known for `hash`.
    pub async fn find_providers(&self, hash: ContentHash) -> Vec<Contact> {
        let result = self.lookup.run(hash, LookupMode::Value).await;
        tracing::debug!(hash = %hash, found = result.outcome.is_found(), "provider search finished");
        self.content.remote_providers_of(&hash)
    }

    /// Store a provider record for local content at the nodes closest to
    /// its hash. Returns how many accepted it.
    pub async fn publish_provider(&self, hash: ContentHash) -> usize {
        let result = self.lookup.run(hash, LookupMode::Node).await;
        let closest = match result.outcome {
            LookupOutcome::Converged { closest } | LookupOutcome::NotFound { closest, .. } => closest,
            LookupOutcome::Found { .. } => Vec::new(),
        };
        let ttl = self.config.dht.provider_ttl();
        let stores = closest.iter().map(|c| {
            let client = self.client.clone();
            let addr = c.addr;
            async move { client.store(addr, hash, ttl).await }
        });
        let accepted = join_all(stores).await.into_iter().filter(Result::is_ok).count();
        tracing::debug!(hash = %hash, accepted, "provider record published");
        accepted
    }

    /// Announce completed local content locally and to the network.
    pub fn announce_local(&self, hash: ContentHash) {
        self.content.announce(hash);
        self.events.publish(EngineEvent::ContentAnnounced { hash });
        if self.dht_enabled() {
            let shared = self.clone();
            tokio::spawn(async move {
                shared.publish_provider(hash).await;
            });
        }
    }

    fn handle_request(&self, from: Contact, message: Message, now: Instant) -> Message {
        let kind = message.kind();
        self.traffic.record_received(kind);
        self.traffic.record_inbound(from.id, now);
        record_peer(&self.routing, &self.events, from.id, from.addr, None);
        tracing::trace!(from = %from.id, kind = kind.name(), "inbound request");

        let reply = match message {
            Message::Ping => Message::Pong,
            Message::FindNode { target } => Message::Nodes {
                contacts: self.closest_to(&target, &from.id),
            },
            Message::FindValue { hash } => {
                let manifest = self
                    .content
                    .manifest(&hash)
                    .filter(|m| m.chunk_count() <= MANIFEST_INLINE_CHUNKS);
                let mut providers = self.content.providers_of(&hash);
                providers.truncate(MAX_CONTACTS);
                Message::Value {
                    providers,
                    closer: self.closest_to(&hash, &from.id),
                    manifest,
                }
            }
            Message::Store { hash, ttl_secs } => {
                self.traffic.record_store_received();
                self.content
                    .record_provider(hash, from, std::time::Duration::from_secs(ttl_secs));
                Message::Stored
            }
            Message::GetManifest { hash } => match self.content.manifest(&hash) {
                Some(manifest) => Message::ManifestReply { manifest },
                None => Message::error(ErrorCode::Unavailable, "unknown content"),
            },
            Message::GetChunk { hash, index } => self.serve_chunk(from, hash, index, now),
            other => Message::error(
                ErrorCode::BadRequest,
                format!("{} is not a request", other.kind().name()),
            ),
        };
        self.traffic.record_sent(reply.kind());
        reply
    }

    fn closest_to(&self, target: &Id, requester: &NodeId) -> Vec<Contact> {
        self.routing
            .find_closest(target, self.routing.k() + 1)
            .into_iter()
            .filter(|p| p.id != *requester)
            .take(self.routing.k().min(MAX_CONTACTS))
            .map(|p| p.contact())
            .collect()
    }

    fn serve_chunk(&self, from: Contact, hash: ContentHash, index: u32, now: Instant) -> Message {
        let Some(manifest) = self.content.manifest(&hash) else {
            return Message::error(ErrorCode::Unavailable, "unknown content");
        };
        if !self.content.has_chunk(&hash, index) {
            return Message::error(ErrorCode::Unavailable, "chunk not held");
        }
        if !self.limits.upload.try_take_at(manifest.chunk_len(index), now) {
            return Message::error(ErrorCode::Busy, "upload limit reached");
        }
        match self.cache.get(&hash, index) {
            Ok(Some(data)) => {
                self.traffic.add_bytes_out(data.len() as u64);
                self.scheduler
                    .record_upload(&manifest, index, data.len() as u64, from.id, now);
                tracing::trace!(to = %from.id, hash = %hash, index, "chunk served");
                Message::Chunk {
                    hash,
                    index,
                    data: data.to_vec(),
                }
            }
            Ok(None) => Message::error(ErrorCode::Unavailable, "chunk not cached"),
            Err(e) => {
                tracing::warn!(hash = %hash, index, error = %e, "chunk cache read failed");
                Message::error(ErrorCode::Unavailable, "chunk unreadable")
            }
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    shared: Shared,
    stats: StatsAggregator,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: MeridianConfig, transport: Arc<dyn Transport>, cache: ChunkCache) -> Arc<Self> {
        let local = Contact::new(transport.local_id(), transport.local_addr());
        let dht = &config.dht;
        let events = EventBus::default();
        let traffic = Arc::new(TrafficCounters::new());

        let routing = Arc::new(RoutingTable::new(local.id, dht.k, dht.failure_limit));
        let content = Arc::new(ContentStore::new(local, dht.provider_ttl(), dht.max_provider_ttl()));
        let scheduler = Arc::new(TransferScheduler::new(SchedulerConfig::from(&config), events.clone()));
        let client = PeerClient::new(
            transport,
            traffic.clone(),
            dht.query_timeout(),
            config.transfer.chunk_timeout(),
        );
        let lookup = Lookup::new(
            routing.clone(),
            content.clone(),
            client.clone(),
            traffic.clone(),
            events.clone(),
            LookupConfig {
                k: dht.k,
                alpha: dht.alpha,
                deadline: dht.lookup_deadline(),
            },
        );
        let stats = StatsAggregator::new(
            routing.clone(),
            content.clone(),
            scheduler.clone(),
            traffic.clone(),
            dht.active_window(),
        );
        let limits = Arc::new(Limits::new(&config.limits));
        let (shutdown, _) = broadcast::channel(1);

        tracing::info!(node = %local.id, addr = %local.addr, "engine created");

        Arc::new(Self {
            shared: Shared {
                local,
                config: Arc::new(config),
                routing,
                content,
                cache,
                scheduler,
                traffic,
                client,
                lookup,
                events,
                limits,
                searching: Arc::new(DashSet::new()),
            },
            stats,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Handler to attach to a transport's inbound side.
    pub fn handler(self: &Arc<Self>) -> Arc<dyn RequestHandler> {
        self.clone()
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.local.id
    }

    pub fn local_contact(&self) -> Contact {
        self.shared.local
    }

    pub fn config(&self) -> &MeridianConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.shared.cache
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Spawn the periodic tasks. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let driver = TransferDriver::new(self.shared.clone(), self.shutdown.subscribe());
        let maintenance = Maintenance::new(self.shared.clone(), self.shutdown.subscribe());
        let handles = vec![tokio::spawn(driver.run()), tokio::spawn(maintenance.run())];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        tracing::info!(node = %self.node_id(), "engine started");
    }

    /// Stop the periodic tasks, abort in-flight transfers and wait for the
    /// tasks to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.shared.scheduler.abort_all();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "engine task ended abnormally");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!(node = %self.node_id(), "engine stopped");
    }

    /// Ping the seed addresses, then look up our own id to fill the table.
    /// Returns how many seeds answered.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> usize {
        let pings = seeds.iter().map(|addr| {
            let client = self.shared.client.clone();
            let addr = *addr;
            async move { (addr, client.ping(addr).await) }
        });
        let mut reached = 0;
        for (addr, result) in join_all(pings).await {
            match result {
                Ok(reply) => {
                    record_peer(&self.shared.routing, &self.shared.events, reply.from, addr, Some(reply.rtt));
                    reached += 1;
                }
                Err(e) => tracing::warn!(seed = %addr, error = %e, "bootstrap seed unreachable"),
            }
        }
        if reached > 0 && self.shared.dht_enabled() {
            self.shared.lookup.run(self.node_id(), LookupMode::Node).await;
        }
        tracing::info!(seeds = seeds.len(), reached, peers = self.shared.routing.len(), "bootstrap finished");
        reached
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.shared.routing.snapshot(self.shared.config.dht.active_window())
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot_at(now())
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.shared.scheduler.list(now())
    }

    pub fn session(&self, id: SessionId) -> Result<SessionSnapshot, EngineError> {
        self.shared
            .scheduler
            .get(id, now())
            .ok_or_else(|| EngineError::UnknownSession(id.to_string()))
    }

    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        self.shared.content.search(query)
    }

    pub fn providers(&self, hash: &ContentHash) -> Vec<Contact> {
        self.shared.content.providers_of(hash)
    }

    pub fn manifest(&self, hash: &ContentHash) -> Option<Manifest> {
        self.shared.content.manifest(hash)
    }

    pub async fn lookup(&self, target: Id, mode: LookupMode) -> LookupResult {
        self.shared.lookup.run(target, mode).await
    }

    pub fn limits(&self) -> LimitsConfig {
        self.shared.limits.current()
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Start downloading `hash`. `size` is a hint used until the manifest
    /// arrives.
    pub fn start_download(&self, hash: ContentHash, size: u64) -> SessionId {
        let content = &self.shared.content;
        content.ensure(hash);
        let manifest = content.manifest(&hash);
        let size = manifest.as_ref().map_or(size, |m| m.size);
        self.shared
            .scheduler
            .start_download(hash, size, manifest, content.local_chunks(&hash), now())
    }

    pub fn pause(&self, id: SessionId) -> Result<(), EngineError> {
        self.shared.scheduler.pause(id, now())
    }

    pub fn resume(&self, id: SessionId) -> Result<(), EngineError> {
        self.shared.scheduler.resume(id, now())
    }

    pub fn cancel(&self, id: SessionId) -> Result<(), EngineError> {
        self.shared.scheduler.cancel(id, now())
    }

    pub fn dismiss(&self, id: SessionId) -> Result<(), EngineError> {
        self.shared.scheduler.dismiss(id)
    }

    /// Chunk `data`, cache it, and announce it as local content.
    pub fn share_bytes(&self, name: &str, data: &[u8]) -> Result<SharedContent, EngineError> {
        let chunk_size = self.shared.config.transfer.chunk_size;
        let manifest = Manifest::build(name, data, chunk_size);
        if manifest.chunk_count() > MAX_MANIFEST_CHUNKS {
            return Err(EngineError::Storage(format!(
                "{name} needs {} chunks, at most {MAX_MANIFEST_CHUNKS} fit in a manifest",
                manifest.chunk_count()
            )));
        }
        let hash = manifest.content_hash();
        for (index, chunk) in data.chunks(chunk_size.max(1) as usize).enumerate() {
            self.shared
                .cache
                .put(&hash, index as u32, chunk)
                .map_err(|e| EngineError::Storage(format!("{e:#}")))?;
        }
        let shared = SharedContent {
            hash,
            name: manifest.name.clone(),
            size: manifest.size,
            chunks: manifest.chunk_count(),
        };
        self.shared.content.insert_complete(manifest);
        self.shared.announce_local(hash);
        tracing::info!(hash = %hash, name, size = shared.size, chunks = shared.chunks, "content shared");
        Ok(shared)
    }

    pub async fn share_file(&self, path: &Path) -> Result<SharedContent, EngineError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to read {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        self.share_bytes(&name, &data)
    }

    /// Re-announce content we hold at least part of.
    pub fn announce(&self, hash: ContentHash) -> Result<(), EngineError> {
        let held = self
            .shared
            .content
            .local_chunks(&hash)
            .is_some_and(|b| b.count() > 0);
        if !held {
            return Err(EngineError::UnknownContent(hash));
        }
        self.shared.announce_local(hash);
        Ok(())
    }

    /// Write completed content out of the cache to `dest`.
    pub fn export(&self, hash: ContentHash, dest: &Path) -> Result<u64, EngineError> {
        let manifest = self
            .shared
            .content
            .manifest(&hash)
            .ok_or(EngineError::UnknownContent(hash))?;
        let complete = self
            .shared
            .content
            .local_chunks(&hash)
            .is_some_and(|b| b.is_complete() || manifest.chunk_count() == 0);
        if !complete {
            return Err(EngineError::UnknownContent(hash));
        }
        self.shared
            .cache
            .assemble(&hash, manifest.chunk_count(), dest)
            .map_err(|e| EngineError::Storage(format!("{e:#}")))
    }

    /// Apply new limits. All values are checked before any is applied.
    pub fn update_limits(&self, update: &LimitsUpdate) -> Result<LimitsConfig, EngineError> {
        let download = non_negative("max_download_bps", update.max_download_bps)?;
        let upload = non_negative("max_upload_bps", update.max_upload_bps)?;
        let connections = non_negative("max_connections", update.max_connections)?
            .map(|n| {
                u32::try_from(n).map_err(|_| {
                    EngineError::ConfigurationInvalid(format!("max_connections must be at most {} (got {n})", u32::MAX))
                })
            })
            .transpose()?;

        let limits = &self.shared.limits;
        if let Some(bps) = download {
            limits.download.set_rate_at(bps, now());
        }
        if let Some(bps) = upload {
            limits.upload.set_rate_at(bps, now());
        }
        if let Some(n) = connections {
            limits.max_connections.store(n as usize, Ordering::Relaxed);
        }
        let current = limits.current();
        tracing::info!(
            max_download_bps = current.max_download_bps,
            max_upload_bps = current.max_upload_bps,
            max_connections = current.max_connections,
            "limits updated"
        );
        Ok(current)
    }

    /// Answer one inbound request.
    pub fn handle_request(&self, from: Contact, message: Message) -> Message {
        self.shared.handle_request(from, message, now())
    }

    /// Run one transfer-driver step outside the background task.
    pub fn drive_transfers(&self) {
        TransferDriver::step(&self.shared, now());
    }
}

impl RequestHandler for Engine {
    fn handle(&self, from: Contact, message: Message) -> BoxFuture<'static, Message> {
        let reply = self.handle_request(from, message);
        async move { reply }.boxed()
    }
}
