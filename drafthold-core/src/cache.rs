/*!
Bounded LRU cache of derived export artifacts.

Entries are keyed by a fingerprint of the export parameters and the document
content, so a changed document or a different export size never hits a stale
entry. Large values are stored compressed. A value that no longer
decompresses is dropped and reported as a miss; the caller recomputes it.
*/

use crate::compression::{BestEffortCompressor, Stored};
use crate::observability;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Default number of cached artifacts
pub const DEFAULT_CACHE_CAPACITY: usize = 20;

/// Output format of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Svg,
    Png,
    Jpeg,
}

impl ExportFormat {
    /// Whether stored bytes of this format are worth compressing
    pub fn is_compressible(&self) -> bool {
        matches!(self, Self::Json | Self::Svg)
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Json => "json",
            Self::Svg => "svg",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        };
        f.write_str(name)
    }
}

/// Parameters of one export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportRequest {
    pub width: u32,
    pub height: u32,
    pub format: ExportFormat,
}

impl ExportRequest {
    pub fn new(width: u32, height: u32, format: ExportFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Serialized snapshot export (dimensions do not apply)
    pub fn json() -> Self {
        Self::new(0, 0, ExportFormat::Json)
    }

    /// Cache key for this request over `content`
    pub fn fingerprint(&self, content: &[u8]) -> String {
        let hash = Sha256::digest(content);
        format!("{}-{}x{}-{:x}", self.format, self.width, self.height, hash)
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Stored,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Fixed-capacity LRU cache of export artifacts
pub struct ExportCache {
    capacity: usize,
    codec: Arc<BestEffortCompressor>,
    state: Mutex<CacheState>,
}

impl ExportCache {
    pub fn new(capacity: usize, codec: Arc<BestEffortCompressor>) -> Self {
        Self {
            capacity,
            codec,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Presence check that does not count as a use
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Look up `key`, marking it most recently used on a hit
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.lock();
        let now = state.tick();

        let Some(entry) = state.entries.get_mut(key) else {
            observability::record_cache_lookup(false);
            return None;
        };
        entry.last_used = now;

        match self.codec.unpack(&entry.value) {
            Some(bytes) => {
                observability::record_cache_lookup(true);
                Some(Bytes::from(bytes))
            }
            None => {
                warn!(key, "dropping cache entry that failed to decompress");
                state.entries.remove(key);
                observability::record_cache_lookup(false);
                None
            }
        }
    }

    /// Insert or replace `key`, evicting the least recently used entry past capacity
    ///
    /// With `compress_hint` set, values above the compression threshold are
    /// stored compressed when that pays off.
    pub fn put<K: Into<String>>(&self, key: K, value: Bytes, compress_hint: bool) {
        if self.capacity == 0 {
            return;
        }

        let stored = if compress_hint {
            self.codec.pack(value.to_vec())
        } else {
            Stored::Raw(value.to_vec())
        };

        let mut state = self.lock();
        let now = state.tick();
        state.entries.insert(
            key.into(),
            CacheEntry {
                value: stored,
                last_used: now,
            },
        );

        while state.entries.len() > self.capacity {
            if let Some(evicted) = state.evict_lru() {
                debug!(key = %evicted, "evicted least recently used export");
            }
        }
    }

    /// Whether the entry under `key` is stored compressed
    pub fn is_compressed(&self, key: &str) -> Option<bool> {
        self.lock()
            .entries
            .get(key)
            .map(|entry| entry.value.is_compressed())
    }

    /// Drop the least recently used `fraction` of entries (rounded up)
    ///
    /// Returns the number of entries removed.
    pub fn evict_fraction(&self, fraction: f64) -> usize {
        let mut state = self.lock();
        let count = (state.entries.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let mut removed = 0;
        while removed < count && state.evict_lru().is_some() {
            removed += 1;
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::COMPRESSION_THRESHOLD;

    fn cache(capacity: usize) -> ExportCache {
        ExportCache::new(capacity, Arc::new(BestEffortCompressor::new()))
    }

    #[test]
    fn test_put_and_get() {
        let cache = cache(4);
        cache.put("k", Bytes::from_static(b"png bytes"), false);

        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"png bytes")));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_capacity_plus_one_evicts_lru() {
        let cache = cache(DEFAULT_CACHE_CAPACITY);
        for i in 0..DEFAULT_CACHE_CAPACITY {
            cache.put(format!("k{i}"), Bytes::from(vec![i as u8]), false);
        }
        // touch k0 so k1 becomes the least recently used
        assert!(cache.get("k0").is_some());

        cache.put("new", Bytes::from_static(b"x"), false);

        assert_eq!(cache.len(), DEFAULT_CACHE_CAPACITY);
        assert!(cache.contains_key("k0"));
        assert!(!cache.contains_key("k1"));
        assert!(cache.contains_key("new"));
    }

    #[test]
    fn test_replacing_key_does_not_evict() {
        let cache = cache(2);
        cache.put("a", Bytes::from_static(b"1"), false);
        cache.put("b", Bytes::from_static(b"2"), false);
        cache.put("a", Bytes::from_static(b"3"), false);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(Bytes::from_static(b"3")));
    }

    #[test]
    fn test_large_values_stored_compressed_when_hinted() {
        let cache = cache(4);
        let value = Bytes::from(vec![b'a'; COMPRESSION_THRESHOLD * 2]);

        cache.put("hinted", value.clone(), true);
        cache.put("plain", value.clone(), false);

        assert_eq!(cache.is_compressed("hinted"), Some(true));
        assert_eq!(cache.is_compressed("plain"), Some(false));
        assert_eq!(cache.get("hinted"), Some(value));
    }

    #[test]
    fn test_corrupted_entry_becomes_miss() {
        let cache = cache(4);
        {
            let mut state = cache.lock();
            let now = state.tick();
            state.entries.insert(
                "bad".to_string(),
                CacheEntry {
                    value: Stored::Compressed(b"not gzip".to_vec()),
                    last_used: now,
                },
            );
        }

        assert_eq!(cache.get("bad"), None);
        assert!(!cache.contains_key("bad"));
    }

    #[test]
    fn test_evict_half() {
        let cache = cache(10);
        for i in 0..10 {
            cache.put(format!("k{i}"), Bytes::from_static(b"v"), false);
        }

        assert_eq!(cache.evict_fraction(0.5), 5);
        assert_eq!(cache.len(), 5);
        // the oldest half went first
        assert!(!cache.contains_key("k0"));
        assert!(cache.contains_key("k9"));
    }

    #[test]
    fn test_fingerprint_depends_on_params_and_content() {
        let png = ExportRequest::new(800, 600, ExportFormat::Png);
        let small = ExportRequest::new(400, 300, ExportFormat::Png);

        let a = png.fingerprint(b"doc-v1");
        assert_eq!(a, png.fingerprint(b"doc-v1"));
        assert_ne!(a, png.fingerprint(b"doc-v2"));
        assert_ne!(a, small.fingerprint(b"doc-v1"));
        assert!(a.starts_with("png-800x600-"));
    }
}
