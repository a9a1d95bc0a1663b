//! ChunkCache: the single chunk a read stream holds between refills.

use std::ops::Range;

use bytes::Bytes;

use crate::token::ConsistencyToken;

/// Remote bytes `[start, start + data.len())` fetched under `token`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub start: u64,
    pub data: Bytes,
    pub token: Option<ConsistencyToken>,
}

impl Chunk {
    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.data.len() as u64
    }
}

/// Holds at most one chunk and a cursor into it.
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunk: Option<Chunk>,
    cursor: usize,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was cached; nothing carries over.
    pub fn fill(&mut self, chunk: Chunk) {
        self.chunk = Some(chunk);
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.chunk = None;
        self.cursor = 0;
    }

    /// Unread bytes left in the cached chunk.
    pub fn available(&self) -> usize {
        self.chunk
            .as_ref()
            .map_or(0, |c| c.data.len() - self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Remote offset of the next unread byte.
    pub fn position(&self) -> Option<u64> {
        self.chunk.as_ref().map(|c| c.start + self.cursor as u64)
    }

    pub fn chunk(&self) -> Option<&Chunk> {
        self.chunk.as_ref()
    }

    pub fn copy_to(&mut self, buf: &mut [u8]) -> usize {
        let Some(chunk) = &self.chunk else {
            return 0;
        };
        let n = buf.len().min(chunk.data.len() - self.cursor);
        buf[..n].copy_from_slice(&chunk.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        n
    }

    /// Hands out the unread remainder without copying.
    pub fn take_remaining(&mut self) -> Bytes {
        let Some(chunk) = &self.chunk else {
            return Bytes::new();
        };
        let rest = chunk.data.slice(self.cursor..);
        self.cursor = chunk.data.len();
        rest
    }

    /// Skips up to `n` cached bytes and returns how many were skipped.
    pub fn skip(&mut self, n: u64) -> u64 {
        let step = (self.available() as u64).min(n);
        self.cursor += step as usize;
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: u64, data: &'static [u8]) -> Chunk {
        Chunk {
            start,
            data: Bytes::from_static(data),
            token: None,
        }
    }

    #[test]
    fn test_copy_and_position() {
        let mut cache = ChunkCache::new();
        assert_eq!(cache.available(), 0);
        cache.fill(chunk(10, b"abcdef"));
        let mut buf = [0u8; 4];
        assert_eq!(cache.copy_to(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(cache.available(), 2);
        assert_eq!(cache.position(), Some(14));
        assert_eq!(cache.copy_to(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fill_replaces_without_carry_over() {
        let mut cache = ChunkCache::new();
        cache.fill(chunk(0, b"abc"));
        cache.skip(1);
        cache.fill(chunk(3, b"xy"));
        assert_eq!(cache.available(), 2);
        assert_eq!(cache.chunk().unwrap().range(), 3..5);
    }

    #[test]
    fn test_skip_and_take() {
        let mut cache = ChunkCache::new();
        cache.fill(chunk(0, b"abcdef"));
        assert_eq!(cache.skip(2), 2);
        assert_eq!(&cache.take_remaining()[..], b"cdef");
        assert_eq!(cache.skip(5), 0);
        cache.clear();
        assert_eq!(cache.position(), None);
    }
}
