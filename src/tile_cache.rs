//! Byte-bounded LRU cache of decoded raster chunks.
//!
//! Every [`crate::cog_reader::CogReader`] owns one of these, so memory use of
//! a warp or tile render is capped by the cache budget plus one chunk, no
//! matter how large the source raster is. That one extra chunk is the
//! overflow slot: a chunk bigger than the whole budget (a single-strip
//! source, typically) is held there instead of being decoded again on every
//! pixel read.

use lru::LruCache;
use std::sync::Arc;

/// Default budget per reader.
pub const DEFAULT_CAPACITY_BYTES: usize = 64 * 1024 * 1024;

/// Decoded samples of one TIFF chunk (tile or strip), pixel-interleaved.
#[derive(Debug)]
pub struct Chunk {
    /// Row stride in pixels.
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub values: Vec<f64>,
}

impl Chunk {
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.values.len() * std::mem::size_of::<f64>()
    }

    /// Samples of the pixel at chunk-local `(x, y)`.
    #[inline]
    #[must_use]
    pub fn pixel(&self, x: usize, y: usize) -> Option<&[f64]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y * self.width + x) * self.bands;
        self.values.get(start..start + self.bands)
    }
}

/// Key for a chunk: pyramid level (0 = full resolution) and chunk index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ChunkKey {
    pub level: usize,
    pub index: usize,
}

pub struct TileCache {
    current_bytes: usize,
    capacity_bytes: usize,
    entries: LruCache<ChunkKey, Arc<Chunk>>,
    oversized: Option<(ChunkKey, Arc<Chunk>)>,
}

impl TileCache {
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            current_bytes: 0,
            capacity_bytes,
            entries: LruCache::unbounded(),
            oversized: None,
        }
    }

    pub fn get(&mut self, key: &ChunkKey) -> Option<Arc<Chunk>> {
        if let Some(chunk) = self.entries.get(key) {
            return Some(Arc::clone(chunk));
        }
        match &self.oversized {
            Some((k, chunk)) if k == key => Some(Arc::clone(chunk)),
            _ => None,
        }
    }

    /// Insert a chunk, evicting least-recently-used entries until it fits.
    /// A chunk larger than the whole budget replaces the overflow slot.
    pub fn insert(&mut self, key: ChunkKey, chunk: Arc<Chunk>) {
        let size_bytes = chunk.size_bytes();
        if size_bytes > self.capacity_bytes {
            self.oversized = Some((key, chunk));
            return;
        }

        if let Some(old) = self.entries.pop(&key) {
            self.current_bytes = self.current_bytes.saturating_sub(old.size_bytes());
        }

        while self.current_bytes + size_bytes > self.capacity_bytes {
            match self.entries.pop_lru() {
                Some((_key, evicted)) => {
                    self.current_bytes = self.current_bytes.saturating_sub(evicted.size_bytes());
                }
                None => break,
            }
        }

        self.current_bytes = self.current_bytes.saturating_add(size_bytes);
        self.entries.put(key, chunk);
    }

    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Cached chunks, the overflow slot included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.oversized.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}
