//! Transfer scheduler — download and upload sessions, chunk assignment and
//! per-peer request slots.
//!
//! The scheduler never performs I/O. The driver asks it for work
//! ([`TransferScheduler::next_work`]), performs the fetches, and reports back
//! (`on_manifest_received`, `on_chunk_received`, `on_request_failed`).
//! Request slots are global across sessions: a peer serves at most
//! `peer_slots` requests at once no matter which sessions issued them.
//!
//! Session lifecycle:
//!
//! ```text
//! QUEUED → ACTIVE ⇄ PAUSED → COMPLETED | FAILED | CANCELLED
//! ```
//!
//! At most `max_active_downloads` downloads are ACTIVE; the rest wait QUEUED
//! and are promoted in creation order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::task::AbortHandle;

use meridian_core::config::MeridianConfig;
use meridian_core::manifest::chunk_count_for;
use meridian_core::wire::Contact;
use meridian_core::{ChunkBitmap, ContentHash, EngineError, Manifest, NodeId};

use crate::events::{EngineEvent, EventBus};
use crate::transport::RpcError;

/// RTT assumed for peers we have never timed.
const UNKNOWN_RTT_MS: u64 = 250;
/// Score penalty per request slot already in use on a peer.
const SLOT_PENALTY_MS: u64 = 50;
/// Speed samples closer together than this are accumulated.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
/// A session with no data for this long reports zero speed.
const STALL_AFTER: Duration = Duration::from_secs(5);

// ── Identifiers and states ────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn random() -> Self {
        SessionId(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(SessionId)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Queued,
        SessionState::Active,
        SessionState::Paused,
        SessionState::Completed,
        SessionState::Failed,
        SessionState::Cancelled,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Queued => "queued",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

// ── Speed estimate ────────────────────────────────────────────────────────────

/// Exponentially weighted bytes-per-second estimate, updated as chunks
/// arrive.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    smoothing: f64,
    bps: Option<f64>,
    pending: u64,
    last_sample: Option<Instant>,
}

impl SpeedEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::MIN_POSITIVE, 1.0),
            bps: None,
            pending: 0,
            last_sample: None,
        }
    }

    /// Set the baseline the first sample is measured from.
    pub fn start(&mut self, now: Instant) {
        self.last_sample = Some(now);
        self.pending = 0;
    }

    pub fn observe(&mut self, bytes: u64, now: Instant) {
        let Some(last) = self.last_sample else {
            self.start(now);
            self.pending = bytes;
            return;
        };
        self.pending += bytes;
        let dt = now.saturating_duration_since(last);
        if dt < MIN_SAMPLE_INTERVAL {
            return;
        }
        let rate = self.pending as f64 / dt.as_secs_f64();
        self.bps = Some(match self.bps {
            None => rate,
            Some(prev) => self.smoothing * rate + (1.0 - self.smoothing) * prev,
        });
        self.pending = 0;
        self.last_sample = Some(now);
    }

    /// Current estimate; zero once no data has arrived for a while.
    pub fn rate(&self, now: Instant) -> f64 {
        match (self.bps, self.last_sample) {
            (Some(bps), Some(last)) if now.saturating_duration_since(last) < STALL_AFTER => bps,
            _ => 0.0,
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct InFlight {
    peer: NodeId,
    deadline: Instant,
    abort: Option<AbortHandle>,
}

impl InFlight {
    fn cancel(self) -> NodeId {
        if let Some(handle) = self.abort {
            handle.abort();
        }
        self.peer
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    seq: u64,
    hash: ContentHash,
    direction: Direction,
    state: SessionState,
    size: u64,
    manifest: Option<Manifest>,
    chunks: ChunkBitmap,
    in_flight: HashMap<u32, Vec<InFlight>>,
    manifest_request: Option<InFlight>,
    speed: SpeedEstimator,
    bytes_done: u64,
    peers: HashSet<NodeId>,
    strikes: HashMap<NodeId, u32>,
    excluded: HashSet<NodeId>,
    selection_retries: u32,
    store_failures: u32,
    last_provider_query: Option<Instant>,
    last_activity: Instant,
    last_error: Option<String>,
    created_unix: u64,
}

impl Session {
    fn new(seq: u64, hash: ContentHash, direction: Direction, size: u64, smoothing: f64, now: Instant) -> Self {
        Self {
            id: SessionId::random(),
            seq,
            hash,
            direction,
            state: SessionState::Queued,
            size,
            manifest: None,
            chunks: ChunkBitmap::default(),
            in_flight: HashMap::new(),
            manifest_request: None,
            speed: SpeedEstimator::new(smoothing),
            bytes_done: 0,
            peers: HashSet::new(),
            strikes: HashMap::new(),
            excluded: HashSet::new(),
            selection_retries: 0,
            store_failures: 0,
            last_provider_query: None,
            last_activity: now,
            last_error: None,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// All chunks held. Empty content is done as soon as its manifest is.
    fn is_done(&self) -> bool {
        self.chunks.is_complete() || self.manifest.as_ref().is_some_and(|m| m.chunk_count() == 0)
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.values().map(Vec::len).sum::<usize>() + usize::from(self.manifest_request.is_some())
    }

    /// Abort every outstanding request. Returns the peers whose slots must
    /// be released, one entry per slot.
    fn release_all(&mut self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .in_flight
            .drain()
            .flat_map(|(_, reqs)| reqs.into_iter().map(InFlight::cancel))
            .collect();
        if let Some(req) = self.manifest_request.take() {
            peers.push(req.cancel());
        }
        peers
    }

    fn take_request(&mut self, index: Option<u32>, peer: &NodeId) -> Option<InFlight> {
        match index {
            None => {
                if self.manifest_request.as_ref().is_some_and(|r| r.peer == *peer) {
                    self.manifest_request.take()
                } else {
                    None
                }
            }
            Some(index) => {
                let reqs = self.in_flight.get_mut(&index)?;
                let pos = reqs.iter().position(|r| r.peer == *peer)?;
                let req = reqs.remove(pos);
                if reqs.is_empty() {
                    self.in_flight.remove(&index);
                }
                Some(req)
            }
        }
    }

    fn strike(&mut self, peer: NodeId, limit: u32) {
        let strikes = self.strikes.entry(peer).or_insert(0);
        *strikes += 1;
        if *strikes >= limit {
            self.excluded.insert(peer);
            tracing::debug!(session = %self.id, peer = %peer, "peer excluded from session");
        }
    }

    fn total_chunks(&self, chunk_size: u32) -> u32 {
        match &self.manifest {
            Some(m) => m.chunk_count(),
            None if !self.chunks.is_empty() => self.chunks.len(),
            None => chunk_count_for(self.size, chunk_size),
        }
    }

    fn progress(&self) -> f64 {
        if self.state == SessionState::Completed {
            return 1.0;
        }
        if self.chunks.is_empty() {
            return 0.0;
        }
        let p = self.chunks.count() as f64 / self.chunks.len() as f64;
        // only a completed session reports 1.0
        if p >= 1.0 { 0.999 } else { p }
    }

    fn eta_secs(&self, now: Instant) -> Option<u64> {
        if self.state.is_terminal() {
            return None;
        }
        let bps = self.speed.rate(now);
        if bps <= 0.0 {
            return None;
        }
        let remaining = self.size.saturating_sub(self.bytes_done);
        Some((remaining as f64 / bps).ceil() as u64)
    }

    fn snapshot(&self, now: Instant, chunk_size: u32) -> SessionSnapshot {
        let mut peers: Vec<NodeId> = self.peers.iter().copied().collect();
        peers.sort();
        SessionSnapshot {
            id: self.id,
            hash: self.hash,
            name: self.manifest.as_ref().map(|m| m.name.clone()),
            direction: self.direction,
            state: self.state,
            size: self.size,
            total_chunks: self.total_chunks(chunk_size),
            chunks_done: self.chunks.count(),
            progress: self.progress(),
            bytes_done: self.bytes_done,
            speed_bps: self.speed.rate(now) as u64,
            eta_secs: self.eta_secs(now),
            peers,
            in_flight: self.in_flight_count(),
            selection_retries: self.selection_retries,
            last_error: self.last_error.clone(),
            created_unix: self.created_unix,
        }
    }
}

/// Read-only view of a session for queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub hash: ContentHash,
    pub name: Option<String>,
    pub direction: Direction,
    pub state: SessionState,
    pub size: u64,
    pub total_chunks: u32,
    pub chunks_done: u32,
    pub progress: f64,
    pub bytes_done: u64,
    pub speed_bps: u64,
    pub eta_secs: Option<u64>,
    pub peers: Vec<NodeId>,
    pub in_flight: usize,
    pub selection_retries: u32,
    pub last_error: Option<String>,
    pub created_unix: u64,
}

// ── Work ──────────────────────────────────────────────────────────────────────

/// A request the driver should issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    Manifest {
        session: SessionId,
        hash: ContentHash,
        peer: Contact,
    },
    Chunk {
        session: SessionId,
        hash: ContentHash,
        index: u32,
        peer: Contact,
    },
}

impl Work {
    pub fn session(&self) -> SessionId {
        match self {
            Work::Manifest { session, .. } | Work::Chunk { session, .. } => *session,
        }
    }

    pub fn peer(&self) -> Contact {
        match self {
            Work::Manifest { peer, .. } | Work::Chunk { peer, .. } => *peer,
        }
    }

    /// Chunk index, or None for a manifest request.
    pub fn index(&self) -> Option<u32> {
        match self {
            Work::Manifest { .. } => None,
            Work::Chunk { index, .. } => Some(*index),
        }
    }
}

#[derive(Debug, Default)]
pub struct Assignments {
    pub work: Vec<Work>,
    /// Active sessions with no usable provider, due for a provider search.
    pub starving: Vec<(SessionId, ContentHash)>,
}

/// What the scheduler needs to know about peers to assign work.
pub trait SelectionView {
    /// Live providers of `hash`, local node excluded.
    fn providers(&self, hash: &ContentHash) -> Vec<Contact>;

    fn rtt(&self, peer: &NodeId) -> Option<Duration>;

    /// Whether `peer` holds chunk `index`. Providers advertise whole content,
    /// so by default they hold everything.
    fn holds(&self, _peer: &NodeId, _hash: &ContentHash, _index: u32) -> bool {
        true
    }
}

/// Connection and bandwidth limits applied while assigning.
pub struct WorkLimits<'a> {
    /// Distinct peers with outstanding requests. 0 = unlimited.
    pub max_connections: usize,
    /// Called with each chunk's length before it is requested; false stops
    /// assignment for this round.
    pub admit_bytes: &'a mut dyn FnMut(u64) -> bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkOutcome {
    Stored { progress: f64 },
    Duplicate,
    Completed,
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub chunk_size: u32,
    pub max_peer_requests_per_chunk: usize,
    pub peer_slots: usize,
    pub max_in_flight_per_session: usize,
    pub max_active_downloads: usize,
    pub speed_smoothing: f64,
    pub selection_retries: u32,
    pub failure_limit: u32,
    pub chunk_timeout: Duration,
    /// Minimum spacing of provider searches for a starving session.
    pub provider_retry: Duration,
}

impl From<&MeridianConfig> for SchedulerConfig {
    fn from(config: &MeridianConfig) -> Self {
        let t = &config.transfer;
        Self {
            chunk_size: t.chunk_size,
            max_peer_requests_per_chunk: t.max_peer_requests_per_chunk,
            peer_slots: t.peer_slots,
            max_in_flight_per_session: t.max_in_flight_per_session,
            max_active_downloads: t.max_active_downloads,
            speed_smoothing: t.speed_smoothing,
            selection_retries: t.selection_retries,
            failure_limit: config.dht.failure_limit,
            chunk_timeout: t.chunk_timeout(),
            provider_retry: t.provider_refresh().min(Duration::from_secs(2)),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&MeridianConfig::default())
    }
}

/// Aggregates for the stats snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferTotals {
    pub by_state: HashMap<&'static str, usize>,
    pub download_bps: u64,
    pub upload_bps: u64,
    pub outgoing_peers: usize,
}

pub struct TransferScheduler {
    config: SchedulerConfig,
    sessions: DashMap<SessionId, Session>,
    slots: DashMap<NodeId, usize>,
    /// Live upload session per content.
    uploads: DashMap<ContentHash, SessionId>,
    seq: AtomicU64,
    /// Serialises admission and slot allocation.
    admission: Mutex<()>,
    events: EventBus,
}

impl TransferScheduler {
    pub fn new(config: SchedulerConfig, events: EventBus) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            slots: DashMap::new(),
            uploads: DashMap::new(),
            seq: AtomicU64::new(0),
            admission: Mutex::new(()),
            events,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn transition(&self, session: &mut Session, to: SessionState, error: Option<String>) {
        let from = session.state;
        if from == to {
            return;
        }
        session.state = to;
        if error.is_some() {
            session.last_error = error.clone();
        }
        match &error {
            Some(reason) => tracing::warn!(session = %session.id, from = from.name(), to = to.name(), reason = %reason, "session state changed"),
            None => tracing::info!(session = %session.id, from = from.name(), to = to.name(), "session state changed"),
        }
        self.events.publish(EngineEvent::SessionStateChanged {
            session: session.id,
            hash: session.hash,
            direction: session.direction,
            from,
            to,
            error,
        });
        if to == SessionState::Completed {
            self.events.publish(EngineEvent::SessionCompleted {
                session: session.id,
                hash: session.hash,
            });
        }
    }

    fn release_slots(&self, peers: impl IntoIterator<Item = NodeId>) {
        for peer in peers {
            if let Some(mut n) = self.slots.get_mut(&peer) {
                *n = n.saturating_sub(1);
            }
        }
    }

    fn take_slot(&self, peer: NodeId) {
        *self.slots.entry(peer).or_insert(0) += 1;
    }

    pub fn slots_in_use(&self, peer: &NodeId) -> usize {
        self.slots.get(peer).map(|n| *n).unwrap_or(0)
    }

    /// Slot usage per peer, including peers that just dropped to zero.
    pub fn slot_counts(&self) -> Vec<(NodeId, usize)> {
        self.slots.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// Forget peers with no slots in use.
    pub fn prune_idle_slots(&self) {
        self.slots.retain(|_, n| *n > 0);
    }

    fn unknown(id: SessionId) -> EngineError {
        EngineError::UnknownSession(id.to_string())
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Create a download session. An existing live download of the same
    /// content is returned instead of a duplicate.
    pub fn start_download(
        &self,
        hash: ContentHash,
        size: u64,
        manifest: Option<Manifest>,
        local: Option<ChunkBitmap>,
        now: Instant,
    ) -> SessionId {
        if let Some(existing) = self.sessions.iter().find(|s| {
            s.hash == hash && s.direction == Direction::Download && !s.state.is_terminal()
        }) {
            return existing.id;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(seq, hash, Direction::Download, size, self.config.speed_smoothing, now);
        let id = session.id;
        if let Some(manifest) = manifest {
            Self::install_manifest(&mut session, manifest, local);
        }
        let complete = session.is_done();
        tracing::info!(session = %id, hash = %hash, size = session.size, "download created");
        self.events.publish(EngineEvent::SessionCreated {
            session: id,
            hash,
            direction: Direction::Download,
        });
        if complete {
            self.transition(&mut session, SessionState::Completed, None);
        }
        self.sessions.insert(id, session);
        self.promote(now);
        id
    }

    fn install_manifest(session: &mut Session, manifest: Manifest, local: Option<ChunkBitmap>) {
        let count = manifest.chunk_count();
        let mut chunks = ChunkBitmap::new(count);
        let mut bytes_done = 0;
        if let Some(local) = local.filter(|b| b.len() == count) {
            for index in 0..count {
                if local.get(index) {
                    chunks.set(index);
                    bytes_done += manifest.chunk_len(index);
                }
            }
        }
        session.size = manifest.size;
        session.chunks = chunks;
        session.bytes_done = bytes_done;
        session.manifest = Some(manifest);
    }

    /// Promote queued downloads into free active slots, oldest first.
    fn promote(&self, now: Instant) {
        let Ok(_guard) = self.admission.lock() else {
            return;
        };
        let active = self
            .sessions
            .iter()
            .filter(|s| s.direction == Direction::Download && s.state == SessionState::Active)
            .count();
        if active >= self.config.max_active_downloads {
            return;
        }
        let mut queued: Vec<(u64, SessionId)> = self
            .sessions
            .iter()
            .filter(|s| s.direction == Direction::Download && s.state == SessionState::Queued)
            .map(|s| (s.seq, s.id))
            .collect();
        queued.sort();

        for (_, id) in queued.into_iter().take(self.config.max_active_downloads - active) {
            if let Some(mut session) = self.sessions.get_mut(&id) {
                if session.state == SessionState::Queued {
                    session.speed.start(now);
                    session.selection_retries = 0;
                    self.transition(&mut session, SessionState::Active, None);
                }
            }
        }
    }

    pub fn pause(&self, id: SessionId, now: Instant) -> Result<(), EngineError> {
        let released = {
            let mut session = self.sessions.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
            match session.state {
                SessionState::Paused => return Ok(()),
                SessionState::Active | SessionState::Queued => {
                    let released = session.release_all();
                    self.transition(&mut session, SessionState::Paused, None);
                    released
                }
                state => {
                    return Err(EngineError::InvalidTransition { action: "pause", state: state.name() })
                }
            }
        };
        self.release_slots(released);
        self.promote(now);
        Ok(())
    }

    pub fn resume(&self, id: SessionId, now: Instant) -> Result<(), EngineError> {
        {
            let mut session = self.sessions.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
            match session.state {
                SessionState::Active | SessionState::Queued => return Ok(()),
                SessionState::Paused => {
                    session.selection_retries = 0;
                    session.excluded.clear();
                    session.strikes.clear();
                    self.transition(&mut session, SessionState::Queued, None);
                }
                state => {
                    return Err(EngineError::InvalidTransition { action: "resume", state: state.name() })
                }
            }
        }
        self.promote(now);
        Ok(())
    }

    /// Cancel a live session, aborting its requests and freeing its peer
    /// slots at once. Cancelling a finished session dismisses it.
    pub fn cancel(&self, id: SessionId, now: Instant) -> Result<(), EngineError> {
        let released = {
            let mut session = self.sessions.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
            if session.state.is_terminal() {
                drop(session);
                return self.dismiss(id);
            }
            let released = session.release_all();
            self.transition(&mut session, SessionState::Cancelled, None);
            released
        };
        self.release_slots(released);
        self.promote(now);
        Ok(())
    }

    /// Remove a finished session from the list.
    pub fn dismiss(&self, id: SessionId) -> Result<(), EngineError> {
        let state = self.sessions.get(&id).map(|s| s.state).ok_or_else(|| Self::unknown(id))?;
        if !state.is_terminal() {
            return Err(EngineError::InvalidTransition { action: "dismiss", state: state.name() });
        }
        self.sessions.remove(&id);
        tracing::debug!(session = %id, "session dismissed");
        Ok(())
    }

    /// Abort all outstanding requests (engine shutdown).
    pub fn abort_all(&self) {
        let mut released = Vec::new();
        for mut session in self.sessions.iter_mut() {
            released.extend(session.release_all());
        }
        self.release_slots(released);
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    /// Hand out requests for active downloads, respecting per-chunk,
    /// per-peer, per-session and connection limits.
    pub fn next_work(&self, view: &dyn SelectionView, limits: WorkLimits<'_>, now: Instant) -> Assignments {
        let WorkLimits { max_connections, admit_bytes } = limits;
        let Ok(_guard) = self.admission.lock() else {
            return Assignments::default();
        };
        let mut out = Assignments::default();

        let mut active: Vec<(u64, SessionId)> = self
            .sessions
            .iter()
            .filter(|s| s.direction == Direction::Download && s.state == SessionState::Active)
            .map(|s| (s.seq, s.id))
            .collect();
        active.sort();

        let mut connected: usize = self.slots.iter().filter(|e| *e.value() > 0).count();
        let cfg = &self.config;

        'sessions: for (_, id) in active {
            let Some(mut session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if session.state != SessionState::Active {
                continue;
            }

            let candidates: Vec<Contact> = view
                .providers(&session.hash)
                .into_iter()
                .filter(|c| !session.excluded.contains(&c.id))
                .collect();
            if candidates.is_empty() {
                let due = session
                    .last_provider_query
                    .map_or(true, |t| now.saturating_duration_since(t) >= cfg.provider_retry);
                if due {
                    session.last_provider_query = Some(now);
                    out.starving.push((id, session.hash));
                }
                continue;
            }

            // Pick the lowest-score peer that can take one more request.
            let pick = |session: &Session, index: Option<u32>, connected: usize| -> Option<Contact> {
                candidates
                    .iter()
                    .filter(|c| match index {
                        Some(i) => {
                            view.holds(&c.id, &session.hash, i)
                                && !session
                                    .in_flight
                                    .get(&i)
                                    .is_some_and(|reqs| reqs.iter().any(|r| r.peer == c.id))
                        }
                        None => true,
                    })
                    .filter_map(|c| {
                        let in_use = self.slots_in_use(&c.id);
                        if in_use >= cfg.peer_slots {
                            return None;
                        }
                        if in_use == 0 && max_connections > 0 && connected >= max_connections {
                            return None;
                        }
                        let rtt = view.rtt(&c.id).map_or(UNKNOWN_RTT_MS, |d| d.as_millis() as u64);
                        Some((rtt + SLOT_PENALTY_MS * in_use as u64, c.id, *c))
                    })
                    .min_by_key(|(score, id, _)| (*score, *id))
                    .map(|(_, _, c)| c)
            };

            if session.manifest.is_none() {
                if session.manifest_request.is_none() {
                    if let Some(peer) = pick(&session, None, connected) {
                        if self.slots_in_use(&peer.id) == 0 {
                            connected += 1;
                        }
                        self.take_slot(peer.id);
                        session.manifest_request = Some(InFlight {
                            peer: peer.id,
                            deadline: now + cfg.chunk_timeout,
                            abort: None,
                        });
                        session.peers.insert(peer.id);
                        out.work.push(Work::Manifest { session: id, hash: session.hash, peer });
                    }
                }
                continue;
            }

            let mut room = cfg.max_in_flight_per_session.saturating_sub(session.in_flight_count());
            if room == 0 {
                continue;
            }

            // One entry per additional request a chunk may take. Fewest
            // outstanding requests first, then rarest, then lowest index, so
            // duplicate requests only go out once every chunk has one.
            let mut order: Vec<(usize, usize, u32)> = Vec::new();
            for index in session.chunks.missing() {
                let pending = session.in_flight.get(&index).map_or(0, Vec::len);
                let holders = candidates
                    .iter()
                    .filter(|c| view.holds(&c.id, &session.hash, index))
                    .count();
                if holders == 0 {
                    continue;
                }
                let extra = cfg.max_peer_requests_per_chunk.min(holders);
                order.extend((pending..extra).map(|level| (level, holders, index)));
            }
            order.sort();

            for (_, _, index) in order {
                if room == 0 {
                    break;
                }
                let Some(peer) = pick(&session, Some(index), connected) else {
                    continue;
                };
                let len = session.manifest.as_ref().map_or(0, |m| m.chunk_len(index));
                if !admit_bytes(len) {
                    break 'sessions;
                }
                if self.slots_in_use(&peer.id) == 0 {
                    connected += 1;
                }
                self.take_slot(peer.id);
                session.in_flight.entry(index).or_default().push(InFlight {
                    peer: peer.id,
                    deadline: now + cfg.chunk_timeout,
                    abort: None,
                });
                session.peers.insert(peer.id);
                room -= 1;
                out.work.push(Work::Chunk { session: id, hash: session.hash, index, peer });
            }
        }

        if !out.work.is_empty() {
            tracing::debug!(requests = out.work.len(), "assigned transfer work");
        }
        out
    }

    /// Attach the task running `work` so cancellation can abort it. If the
    /// request was already withdrawn the task is aborted on the spot.
    pub fn attach_abort(&self, work: &Work, handle: AbortHandle) {
        let peer = work.peer().id;
        if let Some(mut session) = self.sessions.get_mut(&work.session()) {
            let slot = match work.index() {
                None => session.manifest_request.as_mut().filter(|r| r.peer == peer),
                Some(index) => session
                    .in_flight
                    .get_mut(&index)
                    .and_then(|reqs| reqs.iter_mut().find(|r| r.peer == peer)),
            };
            if let Some(req) = slot {
                req.abort = Some(handle);
                return;
            }
        }
        handle.abort();
    }

    // ── Results ───────────────────────────────────────────────────────────────

    /// Install a manifest fetched from `peer`. A manifest that does not hash
    /// to the session's content counts against the peer and is rejected.
    pub fn on_manifest_received(
        &self,
        id: SessionId,
        peer: NodeId,
        manifest: Manifest,
        local: Option<ChunkBitmap>,
    ) -> Result<(), EngineError> {
        let released;
        let result;
        {
            let mut session = self.sessions.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
            released = session.take_request(None, &peer).map(|r| r.peer);
            if manifest.content_hash() != session.hash {
                session.strike(peer, self.config.failure_limit);
                tracing::warn!(session = %id, peer = %peer, "manifest does not match content hash");
                result = Err(EngineError::ChunkIntegrityMismatch { index: 0, peer });
            } else if session.manifest.is_some() {
                result = Ok(());
            } else {
                Self::install_manifest(&mut session, manifest, local);
                tracing::debug!(session = %id, chunks = session.chunks.len(), "manifest installed");
                if session.is_done() && session.state == SessionState::Active {
                    let rest = session.release_all();
                    self.transition(&mut session, SessionState::Completed, None);
                    drop(session);
                    self.release_slots(rest);
                }
                result = Ok(());
            }
        }
        self.release_slots(released);
        result
    }

    /// Accept chunk `index` of session `id` from `peer`.
    ///
    /// The chunk is verified against the manifest; a mismatch is discarded,
    /// its request withdrawn so the chunk is asked for again, and counted
    /// against the peer. Only ACTIVE sessions accept chunks. The session
    /// completes exactly once, when its last chunk lands.
    pub fn on_chunk_received(
        &self,
        id: SessionId,
        index: u32,
        data: &[u8],
        peer: NodeId,
        now: Instant,
    ) -> Result<ChunkOutcome, EngineError> {
        let mut released: Vec<NodeId> = Vec::new();
        let outcome = {
            let mut session = self.sessions.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
            if session.state != SessionState::Active {
                return Err(EngineError::InvalidTransition {
                    action: "accept a chunk for",
                    state: session.state.name(),
                });
            }
            let valid = session
                .manifest
                .as_ref()
                .is_some_and(|m| m.verify_chunk(index, data));
            if !valid {
                released.extend(session.take_request(Some(index), &peer).map(|r| r.peer));
                session.strike(peer, self.config.failure_limit);
                drop(session);
                self.release_slots(released);
                tracing::warn!(session = %id, peer = %peer, index, "chunk failed integrity check");
                return Err(EngineError::ChunkIntegrityMismatch { index, peer });
            }

            // Every request for this chunk is now moot.
            if let Some(reqs) = session.in_flight.remove(&index) {
                released.extend(reqs.into_iter().map(|r| if r.peer == peer { r.peer } else { r.cancel() }));
            }
            session.strikes.remove(&peer);
            session.peers.insert(peer);
            session.selection_retries = 0;
            session.store_failures = 0;
            session.last_activity = now;

            if !session.chunks.set(index) {
                ChunkOutcome::Duplicate
            } else {
                session.bytes_done += data.len() as u64;
                session.speed.observe(data.len() as u64, now);
                if session.chunks.is_complete() {
                    released.extend(session.release_all());
                    self.transition(&mut session, SessionState::Completed, None);
                    ChunkOutcome::Completed
                } else {
                    let progress = session.progress();
                    self.events.publish(EngineEvent::SessionProgress {
                        session: id,
                        progress,
                        speed_bps: session.speed.rate(now) as u64,
                        eta_secs: session.eta_secs(now),
                    });
                    ChunkOutcome::Stored { progress }
                }
            }
        };
        self.release_slots(released);
        if outcome == ChunkOutcome::Completed {
            self.promote(now);
        }
        Ok(outcome)
    }

    /// Whether `data` is chunk `index` of session `id`'s content.
    pub fn chunk_is_valid(&self, id: SessionId, index: u32, data: &[u8]) -> bool {
        self.sessions
            .get(&id)
            .and_then(|s| s.manifest.as_ref().map(|m| m.verify_chunk(index, data)))
            .unwrap_or(false)
    }

    /// A verified chunk could not be stored locally. Its request is withdrawn
    /// so the chunk is asked for again, without counting against the peer.
    /// The session fails after `failure_limit` storage failures in a row.
    pub fn on_store_failed(&self, id: SessionId, index: u32, peer: NodeId, reason: &str, now: Instant) {
        let (released, failed) = {
            let Some(mut session) = self.sessions.get_mut(&id) else {
                return;
            };
            let mut released: Vec<NodeId> = session.take_request(Some(index), &peer).map(|r| r.peer).into_iter().collect();
            if session.state != SessionState::Active {
                drop(session);
                self.release_slots(released);
                return;
            }
            session.store_failures += 1;
            let failed = session.store_failures >= self.config.failure_limit;
            if failed {
                released.extend(session.release_all());
                let reason = EngineError::Storage(reason.to_string()).to_string();
                self.transition(&mut session, SessionState::Failed, Some(reason));
            }
            (released, failed)
        };
        self.release_slots(released);
        if failed {
            self.promote(now);
        }
    }

    /// A request failed. The slot is released; the chunk becomes eligible
    /// again. Peers that say they lack the content, or keep failing, stop
    /// being asked by this session.
    pub fn on_request_failed(&self, id: SessionId, index: Option<u32>, peer: NodeId, error: &RpcError) {
        let released = {
            let Some(mut session) = self.sessions.get_mut(&id) else {
                return;
            };
            let Some(req) = session.take_request(index, &peer) else {
                return;
            };
            match error {
                RpcError::Unavailable => {
                    session.excluded.insert(peer);
                }
                e if e.counts_against_peer() => session.strike(peer, self.config.failure_limit),
                _ => {}
            }
            tracing::debug!(session = %id, peer = %peer, index = ?index, error = %error, "request failed");
            req.peer
        };
        self.release_slots([released]);
    }

    /// Withdraw requests past their deadline. Returns what expired.
    pub fn check_timeouts(&self, now: Instant) -> Vec<(SessionId, Option<u32>, NodeId)> {
        let mut expired = Vec::new();
        for mut session in self.sessions.iter_mut() {
            let id = session.id;
            let limit = self.config.failure_limit;
            let mut late: Vec<(Option<u32>, InFlight)> = Vec::new();

            if session.manifest_request.as_ref().is_some_and(|r| r.deadline <= now) {
                if let Some(req) = session.manifest_request.take() {
                    late.push((None, req));
                }
            }
            for (index, reqs) in session.in_flight.iter_mut() {
                let mut i = 0;
                while i < reqs.len() {
                    if reqs[i].deadline <= now {
                        late.push((Some(*index), reqs.remove(i)));
                    } else {
                        i += 1;
                    }
                }
            }
            session.in_flight.retain(|_, reqs| !reqs.is_empty());

            for (index, req) in late {
                let peer = req.cancel();
                session.strike(peer, limit);
                expired.push((id, index, peer));
            }
        }
        self.release_slots(expired.iter().map(|(_, _, peer)| *peer));
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "chunk requests timed out");
        }
        expired
    }

    /// Outcome of a provider search for a starving session. The session
    /// fails once searches keep coming back empty.
    pub fn on_provider_search(&self, id: SessionId, providers: &[Contact], now: Instant) {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.state != SessionState::Active {
            return;
        }
        let usable = providers.iter().filter(|c| !session.excluded.contains(&c.id)).count();
        if usable > 0 {
            session.selection_retries = 0;
            return;
        }
        session.selection_retries += 1;
        tracing::debug!(session = %id, retries = session.selection_retries, "no providers found");
        if session.selection_retries >= self.config.selection_retries {
            let reason = EngineError::ProviderExhausted(session.hash).to_string();
            self.transition(&mut session, SessionState::Failed, Some(reason));
            drop(session);
            self.promote(now);
        }
    }

    // ── Uploads ───────────────────────────────────────────────────────────────

    fn new_upload(&self, manifest: &Manifest, now: Instant) -> SessionId {
        let hash = manifest.content_hash();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(seq, hash, Direction::Upload, manifest.size, self.config.speed_smoothing, now);
        session.chunks = ChunkBitmap::new(manifest.chunk_count());
        session.manifest = Some(manifest.clone());
        session.speed.start(now);
        let id = session.id;
        tracing::info!(session = %id, hash = %hash, "upload started");
        self.events.publish(EngineEvent::SessionCreated {
            session: id,
            hash,
            direction: Direction::Upload,
        });
        self.transition(&mut session, SessionState::Active, None);
        self.sessions.insert(id, session);
        id
    }

    /// Record that chunk `index` of local content was sent to `peer`.
    ///
    /// One live upload session per content. It is removed once every chunk
    /// has gone out.
    pub fn record_upload(&self, manifest: &Manifest, index: u32, bytes: u64, peer: NodeId, now: Instant) -> SessionId {
        // The entry stays locked until the session is updated, so concurrent
        // senders of the same content share one session.
        let entry = self.uploads.entry(manifest.content_hash());
        let live = match &entry {
            Entry::Occupied(o) => Some(*o.get())
                .filter(|id| self.sessions.get(id).is_some_and(|s| !s.state.is_terminal())),
            Entry::Vacant(_) => None,
        };
        let id = live.unwrap_or_else(|| self.new_upload(manifest, now));

        let done = match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.peers.insert(peer);
                session.last_activity = now;
                session.bytes_done += bytes;
                session.speed.observe(bytes, now);
                session.chunks.set(index);
                if session.chunks.is_complete() {
                    self.transition(&mut session, SessionState::Completed, None);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        match entry {
            Entry::Occupied(mut o) if !done => {
                o.insert(id);
            }
            Entry::Occupied(o) => {
                o.remove();
            }
            Entry::Vacant(v) if !done => {
                v.insert(id);
            }
            Entry::Vacant(_) => {}
        }
        if done {
            self.sessions.remove(&id);
        }
        id
    }

    /// Finish and remove uploads that have been idle for `idle`.
    pub fn sweep_uploads(&self, idle: Duration, now: Instant) -> usize {
        let is_idle = |s: &Session| {
            s.direction == Direction::Upload
                && s.state == SessionState::Active
                && now.saturating_duration_since(s.last_activity) >= idle
        };
        let candidates: Vec<(SessionId, ContentHash)> = self
            .sessions
            .iter()
            .filter(|s| is_idle(s.value()))
            .map(|s| (s.id, s.hash))
            .collect();

        let mut finished = 0;
        for (id, hash) in candidates {
            let Entry::Occupied(entry) = self.uploads.entry(hash) else {
                continue;
            };
            if *entry.get() != id {
                continue;
            }
            {
                let Some(mut session) = self.sessions.get_mut(&id) else {
                    continue;
                };
                // an upload may have landed since the scan
                if !is_idle(session.value()) {
                    continue;
                }
                self.transition(&mut session, SessionState::Completed, None);
            }
            entry.remove();
            self.sessions.remove(&id);
            finished += 1;
        }
        finished
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn get(&self, id: SessionId, now: Instant) -> Option<SessionSnapshot> {
        self.sessions
            .get(&id)
            .map(|s| s.snapshot(now, self.config.chunk_size))
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|s| s.state)
    }

    /// All sessions in creation order.
    pub fn list(&self, now: Instant) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<(u64, SessionSnapshot)> = self
            .sessions
            .iter()
            .map(|s| (s.seq, s.snapshot(now, self.config.chunk_size)))
            .collect();
        sessions.sort_by_key(|(seq, _)| *seq);
        sessions.into_iter().map(|(_, s)| s).collect()
    }

    /// Hashes of active downloads.
    pub fn active_downloads(&self) -> Vec<(SessionId, ContentHash)> {
        self.sessions
            .iter()
            .filter(|s| s.direction == Direction::Download && s.state == SessionState::Active)
            .map(|s| (s.id, s.hash))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn totals(&self, now: Instant) -> TransferTotals {
        let mut totals = TransferTotals::default();
        for state in SessionState::ALL {
            totals.by_state.insert(state.name(), 0);
        }
        for session in self.sessions.iter() {
            *totals.by_state.entry(session.state.name()).or_insert(0) += 1;
            if session.state != SessionState::Active {
                continue;
            }
            let rate = session.speed.rate(now) as u64;
            match session.direction {
                Direction::Download => totals.download_bps += rate,
                Direction::Upload => totals.upload_bps += rate,
            }
        }
        totals.outgoing_peers = self.slots.iter().filter(|e| *e.value() > 0).count();
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Id;
    use std::net::SocketAddr;

    struct View {
        providers: Vec<Contact>,
        rtts: HashMap<NodeId, Duration>,
    }

    impl SelectionView for View {
        fn providers(&self, _hash: &ContentHash) -> Vec<Contact> {
            self.providers.clone()
        }

        fn rtt(&self, peer: &NodeId) -> Option<Duration> {
            self.rtts.get(peer).copied()
        }
    }

    fn contact(n: u64) -> Contact {
        Contact::new(Id::from_low_u64(n), SocketAddr::from(([10, 0, 0, n as u8], 4100)))
    }

    fn view(peers: &[u64]) -> View {
        View {
            providers: peers.iter().map(|n| contact(*n)).collect(),
            rtts: HashMap::new(),
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            chunk_size: 4,
            max_peer_requests_per_chunk: 2,
            peer_slots: 4,
            max_in_flight_per_session: 16,
            max_active_downloads: 3,
            speed_smoothing: 0.3,
            selection_retries: 3,
            failure_limit: 3,
            chunk_timeout: Duration::from_secs(10),
            provider_retry: Duration::from_secs(1),
        }
    }

    fn content(chunks: usize) -> (Manifest, Vec<u8>) {
        let data: Vec<u8> = (0..chunks * 4).map(|i| (i % 251) as u8).collect();
        (Manifest::build("file.bin", &data, 4), data)
    }

    fn unlimited() -> impl FnMut(u64) -> bool {
        |_| true
    }

    fn assign(s: &TransferScheduler, v: &View, now: Instant) -> Assignments {
        let mut admit = unlimited();
        s.next_work(v, WorkLimits { max_connections: 0, admit_bytes: &mut admit }, now)
    }

    fn chunk<'a>(data: &'a [u8], index: u32) -> &'a [u8] {
        let start = index as usize * 4;
        &data[start..(start + 4).min(data.len())]
    }

    #[test]
    fn session_id_hex_roundtrip() {
        let id = SessionId(0xabc);
        assert_eq!(id.to_string(), "0000000000000abc");
        assert_eq!("0000000000000abc".parse::<SessionId>().unwrap(), id);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0000000000000abc\"");
    }

    #[test]
    fn speed_estimator_smooths_and_stalls() {
        let t0 = Instant::now();
        let mut speed = SpeedEstimator::new(0.5);
        speed.start(t0);
        speed.observe(1000, t0 + Duration::from_secs(1));
        assert!((speed.rate(t0 + Duration::from_secs(1)) - 1000.0).abs() < 1e-6);
        speed.observe(3000, t0 + Duration::from_secs(2));
        assert!((speed.rate(t0 + Duration::from_secs(2)) - 2000.0).abs() < 1e-6);
        assert_eq!(speed.rate(t0 + Duration::from_secs(60)), 0.0);
    }

    #[test]
    fn admission_caps_active_downloads() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let now = Instant::now();
        let ids: Vec<SessionId> = (0..5)
            .map(|i| s.start_download(Id::from_low_u64(100 + i), 100, None, None, now))
            .collect();
        let states: Vec<SessionState> = ids.iter().map(|id| s.state(*id).unwrap()).collect();
        assert_eq!(&states[..3], &[SessionState::Active; 3]);
        assert_eq!(&states[3..], &[SessionState::Queued; 2]);

        s.cancel(ids[0], now).unwrap();
        assert_eq!(s.state(ids[3]), Some(SessionState::Active));
        assert_eq!(s.state(ids[4]), Some(SessionState::Queued));
    }

    #[test]
    fn same_content_is_not_downloaded_twice() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let now = Instant::now();
        let a = s.start_download(Id::from_low_u64(7), 10, None, None, now);
        let b = s.start_download(Id::from_low_u64(7), 10, None, None, now);
        assert_eq!(a, b);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn manifest_is_fetched_before_chunks() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(4);
        let hash = m.content_hash();
        let now = Instant::now();
        let id = s.start_download(hash, m.size, None, None, now);

        let work = assign(&s, &view(&[1]), now).work;
        assert_eq!(work.len(), 1);
        assert!(matches!(work[0], Work::Manifest { .. }));
        assert!(assign(&s, &view(&[1]), now).work.is_empty());

        s.on_manifest_received(id, contact(1).id, m, None).unwrap();
        let work = assign(&s, &view(&[1]), now).work;
        assert_eq!(work.len(), 4);
        assert!(work.iter().all(|w| w.index().is_some()));
    }

    #[test]
    fn mismatched_manifest_is_rejected() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(2);
        let (other, _) = content(3);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, None, None, now);
        assert_eq!(assign(&s, &view(&[1]), now).work.len(), 1);

        let err = s.on_manifest_received(id, contact(1).id, other, None).unwrap_err();
        assert!(matches!(err, EngineError::ChunkIntegrityMismatch { .. }));
        assert_eq!(s.slots_in_use(&contact(1).id), 0);
    }

    #[test]
    fn no_chunk_requested_from_more_than_c_peers() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(2);
        let now = Instant::now();
        s.start_download(m.content_hash(), m.size, Some(m), None, now);

        let work = assign(&s, &view(&[1, 2, 3, 4]), now).work;
        let mut per_chunk: HashMap<u32, Vec<NodeId>> = HashMap::new();
        for w in &work {
            per_chunk.entry(w.index().unwrap()).or_default().push(w.peer().id);
        }
        assert_eq!(per_chunk.len(), 2);
        for peers in per_chunk.values() {
            assert_eq!(peers.len(), 2);
            assert_ne!(peers[0], peers[1]);
        }
        assert!(assign(&s, &view(&[1, 2, 3, 4]), now).work.is_empty());
    }

    #[test]
    fn per_peer_slots_are_global_across_sessions() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let now = Instant::now();
        let (a, _) = content(10);
        let b = Manifest::build("other.bin", &[9u8; 40], 4);
        s.start_download(a.content_hash(), a.size, Some(a), None, now);
        s.start_download(b.content_hash(), b.size, Some(b), None, now);

        let work = assign(&s, &view(&[1]), now).work;
        assert_eq!(work.len(), 4);
        assert_eq!(s.slots_in_use(&contact(1).id), 4);
    }

    #[test]
    fn lower_rtt_and_fewer_slots_preferred() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(1);
        let now = Instant::now();
        s.start_download(m.content_hash(), m.size, Some(m), None, now);

        let mut v = view(&[1, 2]);
        v.rtts.insert(contact(1).id, Duration::from_millis(300));
        v.rtts.insert(contact(2).id, Duration::from_millis(20));
        let work = assign(&s, &v, now).work;
        assert_eq!(work[0].peer(), contact(2));
        assert_eq!(work[1].peer(), contact(1));
    }

    #[test]
    fn max_connections_bounds_distinct_peers() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(12);
        let now = Instant::now();
        s.start_download(m.content_hash(), m.size, Some(m), None, now);

        let mut admit = unlimited();
        let work = s
            .next_work(&view(&[1, 2, 3]), WorkLimits { max_connections: 1, admit_bytes: &mut admit }, now)
            .work;
        let peers: HashSet<NodeId> = work.iter().map(|w| w.peer().id).collect();
        assert_eq!(peers.len(), 1);
        assert_eq!(work.len(), 4);
    }

    #[test]
    fn download_budget_stops_assignment() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(8);
        let now = Instant::now();
        s.start_download(m.content_hash(), m.size, Some(m), None, now);

        let mut budget = 8u64;
        let mut admit = |n: u64| {
            if budget >= n {
                budget -= n;
                true
            } else {
                false
            }
        };
        let work = s
            .next_work(&view(&[1, 2, 3]), WorkLimits { max_connections: 0, admit_bytes: &mut admit }, now)
            .work;
        assert_eq!(work.len(), 2);
    }

    #[test]
    fn two_providers_fifty_chunks_each_complete_once() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut cfg = config();
        cfg.max_in_flight_per_session = 200;
        cfg.peer_slots = 100;
        let s = TransferScheduler::new(cfg, bus);
        let (m, data) = content(100);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, now);

        let work = assign(&s, &view(&[1, 2]), now).work;
        let mut last_progress = 0.0;
        let mut completions = 0;
        for w in work.iter().filter(|w| {
            let i = w.index().unwrap();
            (i < 50 && w.peer() == contact(1)) || (i >= 50 && w.peer() == contact(2))
        }) {
            let index = w.index().unwrap();
            match s.on_chunk_received(id, index, chunk(&data, index), w.peer().id, now).unwrap() {
                ChunkOutcome::Stored { progress } => {
                    assert!(progress >= last_progress && progress < 1.0);
                    last_progress = progress;
                    assert_eq!(s.state(id), Some(SessionState::Active));
                }
                ChunkOutcome::Completed => completions += 1,
                ChunkOutcome::Duplicate => {}
            }
        }
        assert_eq!(completions, 1);
        let snap = s.get(id, now).unwrap();
        assert_eq!(snap.state, SessionState::Completed);
        assert_eq!(snap.progress, 1.0);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(s.slots_in_use(&contact(1).id), 0);
        assert_eq!(s.slots_in_use(&contact(2).id), 0);

        let mut completed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::SessionCompleted { .. }) {
                completed_events += 1;
            }
        }
        assert_eq!(completed_events, 1);
    }

    #[test]
    fn corrupt_chunk_is_discarded_and_requested_again() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, data) = content(1);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, now);

        let work = assign(&s, &view(&[1]), now).work;
        assert_eq!(work.len(), 1);
        let err = s.on_chunk_received(id, 0, b"evil", contact(1).id, now).unwrap_err();
        assert_eq!(err, EngineError::ChunkIntegrityMismatch { index: 0, peer: contact(1).id });
        assert_eq!(s.get(id, now).unwrap().chunks_done, 0);
        assert_eq!(s.slots_in_use(&contact(1).id), 0);

        let again = assign(&s, &view(&[1]), now).work;
        assert_eq!(again.len(), 1);
        assert_eq!(s.on_chunk_received(id, 0, chunk(&data, 0), contact(1).id, now).unwrap(), ChunkOutcome::Completed);
    }

    #[test]
    fn paused_session_rejects_chunks_and_frees_slots() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, data) = content(3);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, now);
        assign(&s, &view(&[1]), now);
        assert_eq!(s.slots_in_use(&contact(1).id), 3);

        s.pause(id, now).unwrap();
        assert_eq!(s.slots_in_use(&contact(1).id), 0);
        assert!(matches!(
            s.on_chunk_received(id, 0, chunk(&data, 0), contact(1).id, now),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(assign(&s, &view(&[1]), now).work.is_empty());

        s.resume(id, now).unwrap();
        assert_eq!(s.state(id), Some(SessionState::Active));
        assert_eq!(assign(&s, &view(&[1]), now).work.len(), 3);
    }

    #[test]
    fn cancel_releases_slots_for_other_sessions() {
        let mut cfg = config();
        cfg.peer_slots = 2;
        let s = TransferScheduler::new(cfg, EventBus::default());
        let now = Instant::now();
        let (a, _) = content(4);
        let b = Manifest::build("b.bin", &[5u8; 16], 4);
        let first = s.start_download(a.content_hash(), a.size, Some(a), None, now);
        let second = s.start_download(b.content_hash(), b.size, Some(b), None, now);

        let work = assign(&s, &view(&[1]), now).work;
        assert!(work.iter().all(|w| w.session() == first));
        assert!(assign(&s, &view(&[1]), now).work.is_empty());

        s.cancel(first, now).unwrap();
        assert_eq!(s.state(first), Some(SessionState::Cancelled));
        let work = assign(&s, &view(&[1]), now).work;
        assert_eq!(work.len(), 2);
        assert!(work.iter().all(|w| w.session() == second));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_tasks() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(1);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, now);
        let work = assign(&s, &view(&[1]), now).work;

        let task = tokio::spawn(std::future::pending::<()>());
        s.attach_abort(&work[0], task.abort_handle());
        s.cancel(id, now).unwrap();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn terminal_transitions_are_rejected() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, data) = content(1);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, now);
        assign(&s, &view(&[1]), now);
        s.on_chunk_received(id, 0, chunk(&data, 0), contact(1).id, now).unwrap();

        assert_eq!(
            s.resume(id, now).unwrap_err().to_string(),
            "cannot resume a session that is completed"
        );
        assert!(s.pause(id, now).is_err());
        s.dismiss(id).unwrap();
        assert!(matches!(s.dismiss(id), Err(EngineError::UnknownSession(_))));
    }

    #[test]
    fn live_session_cannot_be_dismissed() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let id = s.start_download(Id::from_low_u64(1), 10, None, None, Instant::now());
        assert!(matches!(s.dismiss(id), Err(EngineError::InvalidTransition { action: "dismiss", .. })));
    }

    #[test]
    fn timeouts_release_and_reassign() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(1);
        let t0 = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, t0);
        let work = assign(&s, &view(&[1, 2]), t0).work;
        assert_eq!(work.len(), 2);

        assert!(s.check_timeouts(t0 + Duration::from_secs(5)).is_empty());
        let expired = s.check_timeouts(t0 + Duration::from_secs(10));
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|(sid, index, _)| *sid == id && *index == Some(0)));
        assert_eq!(s.slots_in_use(&contact(1).id), 0);
        assert_eq!(assign(&s, &view(&[1, 2]), t0 + Duration::from_secs(10)).work.len(), 2);
    }

    #[test]
    fn unavailable_peer_is_not_asked_again() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(2);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), None, now);
        let work = assign(&s, &view(&[1]), now).work;
        for w in &work {
            s.on_request_failed(id, w.index(), w.peer().id, &RpcError::Unavailable);
        }
        let next = assign(&s, &view(&[1]), now);
        assert!(next.work.is_empty());
        assert_eq!(next.starving.len(), 1);
    }

    #[test]
    fn empty_provider_set_fails_after_retries() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let now = Instant::now();
        let id = s.start_download(Id::from_low_u64(42), 100, None, None, now);

        let first = assign(&s, &view(&[]), now);
        assert_eq!(first.starving, vec![(id, Id::from_low_u64(42))]);
        // not due again until provider_retry passes
        assert!(assign(&s, &view(&[]), now).starving.is_empty());

        s.on_provider_search(id, &[], now);
        s.on_provider_search(id, &[contact(1)], now);
        s.on_provider_search(id, &[], now);
        s.on_provider_search(id, &[], now);
        assert_eq!(s.state(id), Some(SessionState::Active));
        s.on_provider_search(id, &[], now);

        let snap = s.get(id, now).unwrap();
        assert_eq!(snap.state, SessionState::Failed);
        assert!(snap.last_error.unwrap().contains("no providers"));
        assert!(s.cancel(id, now).is_ok());
        assert!(s.get(id, now).is_none());
    }

    #[test]
    fn uploads_track_sent_chunks_and_idle_out() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(3);
        let t0 = Instant::now();
        let id = s.record_upload(&m, 0, 4, contact(5).id, t0);
        assert_eq!(s.record_upload(&m, 1, 4, contact(6).id, t0), id);

        let snap = s.get(id, t0).unwrap();
        assert_eq!(snap.direction, Direction::Upload);
        assert_eq!(snap.state, SessionState::Active);
        assert_eq!(snap.peers.len(), 2);

        assert_eq!(s.sweep_uploads(Duration::from_secs(30), t0 + Duration::from_secs(31)), 1);
        assert_eq!(s.state(id), None);
        assert!(s.is_empty());
    }

    #[test]
    fn fully_sent_upload_is_removed() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(2);
        let t0 = Instant::now();
        let id = s.record_upload(&m, 0, 4, contact(5).id, t0);
        assert_eq!(s.len(), 1);
        assert_eq!(s.record_upload(&m, 1, 4, contact(5).id, t0), id);
        assert!(s.is_empty());

        // a later request starts a fresh session
        let again = s.record_upload(&m, 0, 4, contact(6).id, t0);
        assert_ne!(again, id);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn idle_upload_bursts_do_not_accumulate() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(4);
        let idle = Duration::from_secs(30);
        let mut t = Instant::now();
        for burst in 0..10u64 {
            s.record_upload(&m, 0, 4, contact(burst).id, t);
            s.record_upload(&m, 1, 4, contact(burst).id, t);
            assert_eq!(s.len(), 1);
            t += idle + Duration::from_secs(1);
            assert_eq!(s.sweep_uploads(idle, t), 1);
            assert!(s.is_empty());
        }
    }

    #[test]
    fn concurrent_senders_share_one_upload() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(64);
        let t0 = Instant::now();
        let ids: Vec<SessionId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u32)
                .map(|i| {
                    let (s, m) = (&s, &m);
                    scope.spawn(move || s.record_upload(m, i, 4, contact(u64::from(i)).id, t0))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(ids[0], t0).unwrap().peers.len(), 8);
    }

    #[test]
    fn storage_failure_requeues_then_fails_session() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let v = view(&[1]);
        let (m, data) = content(4);
        let t0 = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m.clone()), None, t0);

        let first = assign(&s, &v, t0);
        let work = first.work.iter().find(|w| w.index() == Some(0)).unwrap().clone();
        assert!(s.chunk_is_valid(id, 0, chunk(&data, 0)));
        assert!(!s.chunk_is_valid(id, 0, b"junk"));

        s.on_store_failed(id, 0, work.peer().id, "disk full", t0);
        let snap = s.get(id, t0).unwrap();
        assert_eq!(snap.state, SessionState::Active);
        assert_eq!(snap.progress, 0.0);
        assert_eq!(s.slots_in_use(&work.peer().id), first.work.len() - 1);

        // chunk 0 is handed out again
        let again = assign(&s, &v, t0);
        assert!(again.work.iter().any(|w| w.index() == Some(0)));

        for _ in 1..s.config().failure_limit {
            s.on_store_failed(id, 0, work.peer().id, "disk full", t0);
        }
        let snap = s.get(id, t0).unwrap();
        assert_eq!(snap.state, SessionState::Failed);
        assert!(snap.last_error.unwrap().contains("disk full"));
        assert_eq!(s.slots_in_use(&work.peer().id), 0);
    }

    #[test]
    fn local_chunks_are_not_fetched_again() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(4);
        let mut local = ChunkBitmap::new(4);
        local.set(0);
        local.set(2);
        let now = Instant::now();
        let id = s.start_download(m.content_hash(), m.size, Some(m), Some(local), now);

        let mut v = view(&[1]);
        v.providers.push(contact(2));
        let work = assign(&s, &v, now).work;
        let indexes: HashSet<u32> = work.iter().filter_map(|w| w.index()).collect();
        assert_eq!(indexes, HashSet::from([1, 3]));
        assert_eq!(s.get(id, now).unwrap().chunks_done, 2);
    }

    #[test]
    fn fully_held_content_completes_immediately() {
        let s = TransferScheduler::new(config(), EventBus::default());
        let (m, _) = content(2);
        let id = s.start_download(m.content_hash(), m.size, Some(m), Some(ChunkBitmap::full(2)), Instant::now());
        assert_eq!(s.state(id), Some(SessionState::Completed));
    }
}
