//! Content store — what we know about each piece of content: its manifest,
//! which chunks we hold locally, and who claims to provide it.
//!
//! Every known hash has a local chunk bitmap, possibly empty, so "known but
//! not fetched" is distinguishable from "unknown". Provider records expire
//! independently; `sweep_expired` drops them in the background and
//! `providers_of` filters them at read time regardless.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use meridian_core::wire::Contact;
use meridian_core::{ChunkBitmap, ContentHash, Manifest, NodeId};

#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub contact: Contact,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct ContentEntry {
    pub manifest: Option<Manifest>,
    pub local: ChunkBitmap,
    pub providers: HashMap<NodeId, ProviderRecord>,
}

/// A search hit, shaped for the dashboard's search table.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub hash: ContentHash,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub kind: Option<&'static str>,
    pub seeders: usize,
    pub local_chunks: u32,
    pub total_chunks: u32,
    pub complete: bool,
}

pub struct ContentStore {
    local: Contact,
    default_ttl: Duration,
    max_ttl: Duration,
    entries: DashMap<ContentHash, ContentEntry>,
}

impl ContentStore {
    pub fn new(local: Contact, default_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            local,
            default_ttl,
            max_ttl: max_ttl.max(default_ttl),
            entries: DashMap::new(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// Make `hash` known with an empty chunk record if it is not already.
    pub fn ensure(&self, hash: ContentHash) {
        self.entries.entry(hash).or_default();
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }

    // ── Providers ─────────────────────────────────────────────────────────────

    /// Insert or overwrite the local node as a provider with the maximum TTL.
    pub fn announce(&self, hash: ContentHash) {
        self.announce_at(hash, Instant::now());
    }

    pub fn announce_at(&self, hash: ContentHash, now: Instant) {
        let mut entry = self.entries.entry(hash).or_default();
        entry.providers.insert(
            self.local.id,
            ProviderRecord {
                contact: self.local,
                expires_at: now + self.max_ttl,
            },
        );
        tracing::info!(hash = %hash, "announced as provider");
    }

    /// Record that `contact` provides `hash` for `ttl`, capped at the maximum.
    pub fn record_provider(&self, hash: ContentHash, contact: Contact, ttl: Duration) {
        self.record_provider_at(hash, contact, ttl, Instant::now());
    }

    pub fn record_provider_at(&self, hash: ContentHash, contact: Contact, ttl: Duration, now: Instant) {
        if ttl.is_zero() {
            return;
        }
        let expires_at = now + ttl.min(self.max_ttl);
        let mut entry = self.entries.entry(hash).or_default();
        entry
            .providers
            .insert(contact.id, ProviderRecord { contact, expires_at });
        tracing::trace!(hash = %hash, provider = %contact.id, "provider recorded");
    }

    pub fn remove_provider(&self, hash: &ContentHash, id: &NodeId) {
        if let Some(mut entry) = self.entries.get_mut(hash) {
            entry.providers.remove(id);
        }
    }

    /// Live providers of `hash`, ordered by id. Never includes an expired record.
    pub fn providers_of(&self, hash: &ContentHash) -> Vec<Contact> {
        self.providers_of_at(hash, Instant::now())
    }

    pub fn providers_of_at(&self, hash: &ContentHash, now: Instant) -> Vec<Contact> {
        let Some(entry) = self.entries.get(hash) else {
            return Vec::new();
        };
        let mut live: Vec<Contact> = entry
            .providers
            .values()
            .filter(|r| r.expires_at > now)
            .map(|r| r.contact)
            .collect();
        live.sort_by_key(|c| c.id);
        live
    }

    /// Live providers other than the local node.
    pub fn remote_providers_of(&self, hash: &ContentHash) -> Vec<Contact> {
        let mut providers = self.providers_of(hash);
        providers.retain(|c| c.id != self.local.id);
        providers
    }

    /// Drop expired provider records. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for mut entry in self.entries.iter_mut() {
            let before = entry.providers.len();
            entry.providers.retain(|_, r| r.expires_at > now);
            removed += before - entry.providers.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "expired provider records swept");
        }
        removed
    }

    // ── Local chunks and manifests ────────────────────────────────────────────

    /// Chunk presence for `hash`. None when the hash is unknown; an empty
    /// bitmap when known but the chunk count is not.
    pub fn local_chunks(&self, hash: &ContentHash) -> Option<ChunkBitmap> {
        self.entries.get(hash).map(|e| e.local.clone())
    }

    pub fn has_chunk(&self, hash: &ContentHash, index: u32) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|e| e.local.get(index))
    }

    /// Mark chunk `index` present. Returns true if newly set.
    pub fn mark_chunk(&self, hash: &ContentHash, index: u32) -> bool {
        self.entries
            .get_mut(hash)
            .map(|mut e| e.local.set(index))
            .unwrap_or(false)
    }

    pub fn manifest(&self, hash: &ContentHash) -> Option<Manifest> {
        self.entries.get(hash).and_then(|e| e.manifest.clone())
    }

    /// Attach a manifest to `hash` if it hashes to `hash`. Returns false for a
    /// manifest that does not match.
    pub fn set_manifest(&self, hash: ContentHash, manifest: Manifest) -> bool {
        if manifest.content_hash() != hash {
            return false;
        }
        let mut entry = self.entries.entry(hash).or_default();
        entry.local.resize_if_unknown(manifest.chunk_count());
        entry.manifest = Some(manifest);
        true
    }

    /// Record fully held local content.
    pub fn insert_complete(&self, manifest: Manifest) -> ContentHash {
        let hash = manifest.content_hash();
        let mut entry = self.entries.entry(hash).or_default();
        entry.local = ChunkBitmap::full(manifest.chunk_count());
        entry.manifest = Some(manifest);
        hash
    }

    // ── Listing ───────────────────────────────────────────────────────────────

    pub fn known_count(&self) -> usize {
        self.entries.len()
    }

    /// Hashes for which we hold at least one chunk.
    pub fn local_hashes(&self) -> Vec<ContentHash> {
        self.entries
            .iter()
            .filter(|e| e.local.count() > 0)
            .map(|e| *e.key())
            .collect()
    }

    /// Match a hex prefix of the hash, or a case-insensitive substring of the
    /// manifest name. An empty query lists everything.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        let now = Instant::now();
        let q = query.trim().to_ascii_lowercase();
        let q = q.strip_prefix("0x").unwrap_or(&q).to_string();
        let hex_query = !q.is_empty() && q.chars().all(|c| c.is_ascii_hexdigit());

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .filter(|e| {
                if q.is_empty() {
                    return true;
                }
                let by_hash = hex_query && e.key().to_string().starts_with(&q);
                let by_name = e
                    .manifest
                    .as_ref()
                    .is_some_and(|m| m.name.to_lowercase().contains(&q));
                by_hash || by_name
            })
            .map(|e| SearchResult {
                hash: *e.key(),
                name: e.manifest.as_ref().map(|m| m.name.clone()),
                size: e.manifest.as_ref().map(|m| m.size),
                kind: e.manifest.as_ref().map(|m| m.kind()),
                seeders: e.providers.values().filter(|r| r.expires_at > now).count(),
                local_chunks: e.local.count(),
                total_chunks: e.local.len(),
                complete: e.local.is_complete(),
            })
            .collect();
        results.sort_by(|a, b| b.seeders.cmp(&a.seeders).then(a.hash.cmp(&b.hash)));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Id;
    use std::net::SocketAddr;

    fn contact(n: u64) -> Contact {
        Contact::new(Id::from_low_u64(n), SocketAddr::from(([127, 0, 0, 1], 4000 + n as u16)))
    }

    fn store() -> ContentStore {
        ContentStore::new(contact(0), Duration::from_secs(3600), Duration::from_secs(86_400))
    }

    #[test]
    fn providers_expire_at_read_time() {
        let s = store();
        let hash = Id::from_hash(b"content");
        let t0 = Instant::now();
        s.record_provider_at(hash, contact(1), Duration::from_secs(10), t0);
        s.record_provider_at(hash, contact(2), Duration::from_secs(100), t0);

        assert_eq!(s.providers_of_at(&hash, t0 + Duration::from_secs(5)).len(), 2);
        let later = s.providers_of_at(&hash, t0 + Duration::from_secs(10));
        assert_eq!(later, vec![contact(2)]);
    }

    #[test]
    fn sweep_drops_expired_records_only() {
        let s = store();
        let hash = Id::from_hash(b"content");
        let t0 = Instant::now();
        s.record_provider_at(hash, contact(1), Duration::from_secs(10), t0);
        s.record_provider_at(hash, contact(2), Duration::from_secs(100), t0);

        assert_eq!(s.sweep_expired_at(t0 + Duration::from_secs(50)), 1);
        assert!(s.contains(&hash));
        assert_eq!(s.providers_of_at(&hash, t0).len(), 1);
    }

    #[test]
    fn ttl_is_capped_at_max() {
        let s = store();
        let hash = Id::from_hash(b"capped");
        let t0 = Instant::now();
        s.record_provider_at(hash, contact(1), Duration::from_secs(1_000_000), t0);
        assert!(s.providers_of_at(&hash, t0 + Duration::from_secs(86_399)).len() == 1);
        assert!(s.providers_of_at(&hash, t0 + Duration::from_secs(86_400)).is_empty());
    }

    #[test]
    fn announce_overwrites_self_with_max_ttl() {
        let s = store();
        let hash = Id::from_hash(b"mine");
        let t0 = Instant::now();
        s.record_provider_at(hash, contact(0), Duration::from_secs(1), t0);
        s.announce_at(hash, t0);
        assert_eq!(s.providers_of_at(&hash, t0 + Duration::from_secs(3600)), vec![contact(0)]);
        assert!(s.remote_providers_of(&hash).is_empty());
    }

    #[test]
    fn known_hash_always_has_chunk_record() {
        let s = store();
        let hash = Id::from_hash(b"seen");
        assert!(s.local_chunks(&hash).is_none());

        s.record_provider(hash, contact(3), Duration::from_secs(60));
        let bitmap = s.local_chunks(&hash).unwrap();
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn manifest_must_match_hash() {
        let s = store();
        let m = Manifest::build("a.bin", &[1u8; 100], 32);
        let hash = m.content_hash();
        assert!(!s.set_manifest(Id::from_hash(b"other"), m.clone()));
        assert!(s.set_manifest(hash, m));
        assert_eq!(s.local_chunks(&hash).unwrap().len(), 4);
        assert!(s.mark_chunk(&hash, 1));
        assert!(s.has_chunk(&hash, 1));
    }

    #[test]
    fn search_by_name_and_hash_prefix() {
        let s = store();
        let video = s.insert_complete(Manifest::build("Holiday.mp4", &[1u8; 64], 16));
        let doc = s.insert_complete(Manifest::build("notes.txt", &[2u8; 10], 16));
        s.announce(video);

        let hits = s.search("holiday");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].hash, video);
        assert_eq!(hits[0].kind, Some("video"));
        assert_eq!(hits[0].seeders, 1);
        assert!(hits[0].complete);

        let prefix = &doc.to_string()[..8];
        let hits = s.search(prefix);
        assert!(hits.iter().any(|h| h.hash == doc));

        assert_eq!(s.search("").len(), 2);
        assert_eq!(s.local_hashes().len(), 2);
    }
}
