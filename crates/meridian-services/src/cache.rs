//! Content-addressed chunk cache.
//!
//! Chunks are stored under their content hash and index in a two-level
//! directory structure:
//!   {root}/{hash[0..2]}/{hash}/{index}
//!
//! A chunk file is written once and never modified; content hashes commit
//! to every chunk digest, so a present file is correct.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::Mmap;

use meridian_core::ContentHash;

#[derive(Clone)]
pub struct ChunkCache {
    root: PathBuf,
}

impl ChunkCache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has(&self, hash: &ContentHash, index: u32) -> bool {
        self.chunk_path(hash, index).exists()
    }

    /// Read a chunk. None if not present.
    pub fn get(&self, hash: &ContentHash, index: u32) -> Result<Option<Bytes>> {
        let path = self.chunk_path(hash, index);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open chunk: {}", path.display()))?;
        if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
            // mmap of an empty file fails on some platforms
            return Ok(Some(Bytes::new()));
        }

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Store a chunk. Atomic (tmp + rename); a no-op if already present.
    pub fn put(&self, hash: &ContentHash, index: u32, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(hash, index);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        tracing::trace!(hash = %hash, index, "chunk cached");
        Ok(())
    }

    fn content_dir(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_string();
        self.root.join(&hex[0..2]).join(&hex)
    }

    fn chunk_path(&self, hash: &ContentHash, index: u32) -> PathBuf {
        self.content_dir(hash).join(index.to_string())
    }

    /// Concatenate chunks `0..count` into `dest`.
    pub fn assemble(&self, hash: &ContentHash, count: u32, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = fs::File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut written = 0u64;
        for index in 0..count {
            let chunk = self
                .get(hash, index)?
                .with_context(|| format!("chunk {index} of {hash} missing from cache"))?;
            out.write_all(&chunk).context("failed to write assembled file")?;
            written += chunk.len() as u64;
        }
        out.sync_all().context("failed to sync assembled file")?;
        Ok(written)
    }

    /// Total chunks across all content.
    pub fn count(&self) -> usize {
        self.walk_chunks().count()
    }

    /// Total bytes across all chunks.
    pub fn size(&self) -> u64 {
        self.walk_chunks()
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn walk_chunks(&self) -> impl Iterator<Item = fs::DirEntry> {
        fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|prefix| fs::read_dir(prefix.path()).ok())
            .flatten()
            .flatten()
            .filter_map(|content| fs::read_dir(content.path()).ok())
            .flatten()
            .flatten()
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}
