//! Content manifest — name, size, chunk layout and per-chunk digests.
//!
//! The content hash commits to the manifest, so a manifest fetched from any
//! provider can be checked against the hash the downloader asked for, and
//! every chunk can then be checked against its digest.

use serde::{Deserialize, Serialize};

use crate::id::{chunk_digest, ChunkDigest, ContentHash, Id, ID_LEN};

/// Most chunks a manifest may list and still travel in one MANIFEST reply.
pub const MAX_MANIFEST_CHUNKS: u32 = 850;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub size: u64,
    pub chunk_size: u32,
    #[serde(with = "hex_digests")]
    pub chunk_digests: Vec<ChunkDigest>,
}

impl Manifest {
    /// Split `data` into `chunk_size` pieces and record their digests.
    pub fn build(name: impl Into<String>, data: &[u8], chunk_size: u32) -> Self {
        let chunk_digests = data
            .chunks(chunk_size.max(1) as usize)
            .map(chunk_digest)
            .collect();
        Self {
            name: name.into(),
            size: data.len() as u64,
            chunk_size,
            chunk_digests,
        }
    }

    /// The content hash this manifest commits to.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.chunk_size.to_le_bytes());
        for digest in &self.chunk_digests {
            hasher.update(digest);
        }
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..ID_LEN]);
        Id(bytes)
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_digests.len() as u32
    }

    /// Does `data` match the recorded digest for chunk `index`?
    pub fn verify_chunk(&self, index: u32, data: &[u8]) -> bool {
        self.chunk_digests
            .get(index as usize)
            .is_some_and(|expected| *expected == chunk_digest(data))
    }

    /// Byte length of chunk `index` (the last chunk may be short).
    pub fn chunk_len(&self, index: u32) -> u64 {
        chunk_len(self.size, self.chunk_size, index)
    }

    /// Coarse content kind from the file extension, for search results.
    pub fn kind(&self) -> &'static str {
        let ext = self
            .name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "mkv" | "avi" | "mov" | "webm" => "video",
            "mp3" | "flac" | "wav" | "ogg" => "audio",
            "png" | "jpg" | "jpeg" | "gif" | "webp" => "image",
            "zip" | "tar" | "gz" | "xz" | "7z" => "archive",
            "pdf" | "txt" | "md" | "doc" | "docx" => "document",
            "csv" | "json" | "parquet" => "dataset",
            _ => "other",
        }
    }
}

/// Number of chunks needed to hold `size` bytes.
pub fn chunk_count_for(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Byte length of chunk `index` of content of `size` bytes.
pub fn chunk_len(size: u64, chunk_size: u32, index: u32) -> u64 {
    let start = index as u64 * chunk_size as u64;
    size.saturating_sub(start).min(chunk_size as u64)
}

mod hex_digests {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::id::ChunkDigest;

    pub fn serialize<S: Serializer>(digests: &[ChunkDigest], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(digests.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ChunkDigest>, D::Error> {
        let strings = Vec::<String>::deserialize(d)?;
        strings
            .into_iter()
            .map(|s| {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                <ChunkDigest>::try_from(bytes.as_slice())
                    .map_err(|_| serde::de::Error::custom("chunk digest must be 32 bytes"))
            })
            .collect()
    }
}
