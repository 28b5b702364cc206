//! In-memory LRU cache for fully-built HTTP responses.
//!
//! Caches the hottest paths as ready-to-send bytes, so the request path
//! becomes a single lock + map lookup with no re-serialization.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

pub const DEFAULT_MAX_ENTRIES: usize = 2048;
pub const DEFAULT_MAX_MEMORY: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HotEntry {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub cache_control: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HotCacheStats {
    pub entries: usize,
    pub memory_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

impl HotCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

struct Inner {
    cache: LruCache<String, (HotEntry, u64)>,
    memory_used: u64,
}

pub struct HotResponseCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_memory: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HotResponseCache {
    pub fn new(max_entries: usize, max_memory: u64) -> Self {
        let max_entries = max_entries.max(1);
        HotResponseCache {
            inner: Mutex::new(Inner {
                cache: LruCache::new(NonZeroUsize::new(max_entries).unwrap()),
                memory_used: 0,
            }),
            max_entries,
            max_memory,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<HotEntry> {
        let mut inner = self.inner.lock();
        match inner.cache.get(key) {
            Some((entry, _)) => {
                let entry = entry.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, entry: HotEntry) {
        let body_size = entry.body.len() as u64;
        if body_size > self.max_memory / 4 {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some((_, old_size)) = inner.cache.pop(&key) {
            inner.memory_used -= old_size;
        }

        while inner.memory_used + body_size > self.max_memory || inner.cache.len() >= self.max_entries {
            match inner.cache.pop_lru() {
                Some((_, (_, evicted_size))) => inner.memory_used -= evicted_size,
                None => break,
            }
        }

        inner.memory_used += body_size;
        inner.cache.put(key, (entry, body_size));
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some((_, size)) = inner.cache.pop(key) {
            inner.memory_used -= size;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.memory_used = 0;
    }

    pub fn stats(&self) -> HotCacheStats {
        let inner = self.inner.lock();
        HotCacheStats {
            entries: inner.cache.len(),
            memory_bytes: inner.memory_used,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> HotEntry {
        HotEntry {
            status: 200,
            content_type: "text/html".into(),
            body: vec![0u8; n],
            cache_control: "public, max-age=3600, must-revalidate".into(),
        }
    }

    #[test]
    fn get_miss_then_hit() {
        let cache = HotResponseCache::new(10, 1024 * 1024);
        assert!(cache.get("/a").is_none());
        cache.put("/a".into(), entry(10));
        assert!(cache.get("/a").is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn evicts_lru_when_entry_cap_hit() {
        let cache = HotResponseCache::new(2, 1024 * 1024);
        cache.put("/a".into(), entry(1));
        cache.put("/b".into(), entry(1));
        cache.get("/a");
        cache.put("/c".into(), entry(1));
        assert!(cache.get("/b").is_none());
        assert!(cache.get("/a").is_some());
        assert!(cache.get("/c").is_some());
    }

    #[test]
    fn rejects_entry_over_quarter_of_memory_budget() {
        let cache = HotResponseCache::new(10, 100);
        cache.put("/big".into(), entry(40));
        assert!(cache.get("/big").is_none());
    }

    #[test]
    fn evicts_by_memory_budget() {
        let cache = HotResponseCache::new(100, 30);
        cache.put("/a".into(), entry(10));
        cache.put("/b".into(), entry(10));
        cache.put("/c".into(), entry(10));
        cache.put("/d".into(), entry(10));
        assert!(cache.stats().memory_bytes <= 30);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = HotResponseCache::new(10, 1024);
        cache.put("/a".into(), entry(5));
        cache.invalidate("/a");
        assert!(cache.get("/a").is_none());
    }
}
