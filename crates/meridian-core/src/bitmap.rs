//! Chunk presence bitmap.

use serde::{Deserialize, Serialize};

/// Fixed-length bitset recording which chunks of a piece of content are held
/// (or, for uploads, have been sent).
///
/// A zero-length bitmap means the chunk count is not known yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    len: u32,
    words: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; (len as usize).div_ceil(64)],
        }
    }

    /// A bitmap with every chunk marked present.
    pub fn full(len: u32) -> Self {
        let mut bitmap = Self::new(len);
        for i in 0..len {
            bitmap.set(i);
        }
        bitmap
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark chunk `index` present. Returns true if it was newly set.
    /// Out-of-range indexes are ignored.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when every chunk is present. An unknown-length bitmap is never
    /// complete.
    pub fn is_complete(&self) -> bool {
        self.len > 0 && self.count() == self.len
    }

    /// Indexes of chunks not yet present, ascending.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |i| !self.get(*i))
    }

    /// Grow an unknown-length bitmap to `len`. A bitmap that already has a
    /// length is left unchanged.
    pub fn resize_if_unknown(&mut self, len: u32) {
        if self.len == 0 {
            *self = Self::new(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_count() {
        let mut b = ChunkBitmap::new(130);
        assert_eq!(b.count(), 0);
        assert!(b.set(0));
        assert!(b.set(64));
        assert!(b.set(129));
        assert!(!b.set(129));
        assert!(!b.set(130));
        assert!(b.get(64));
        assert!(!b.get(65));
        assert_eq!(b.count(), 3);
    }

    #[test]
    fn missing_lists_unset_indexes() {
        let mut b = ChunkBitmap::new(5);
        b.set(1);
        b.set(3);
        assert_eq!(b.missing().collect::<Vec<_>>(), vec![0, 2, 4]);
    }

    #[test]
    fn completeness() {
        assert!(!ChunkBitmap::default().is_complete());
        assert!(ChunkBitmap::full(70).is_complete());

        let mut b = ChunkBitmap::new(2);
        b.set(0);
        assert!(!b.is_complete());
        b.set(1);
        assert!(b.is_complete());
    }

    #[test]
    fn resize_only_when_unknown() {
        let mut b = ChunkBitmap::default();
        b.resize_if_unknown(10);
        assert_eq!(b.len(), 10);
        b.set(2);
        b.resize_if_unknown(20);
        assert_eq!(b.len(), 10);
        assert!(b.get(2));
    }
}
