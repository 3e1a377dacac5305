//! Sharded, memory-budgeted cache of decompressed entry bytes
//!
//! Serves hot tile bytes without re-decompression. The total byte budget is
//! split evenly across 64 shards; keys combine the zip path and entry name
//! with a NUL separator (which cannot appear in either). A budget of zero
//! disables the cache entirely.

use std::hash::Hasher as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fnv::FnvHasher;
use lru::LruCache;
use parking_lot::Mutex;

use ctarchive_common::Metrics;

const NUM_SHARDS: usize = 64;

struct EntryShard {
    items: LruCache<String, Bytes>,
    cur_bytes: u64,
}

pub struct EntryContentCache {
    shards: Vec<Mutex<EntryShard>>,
    per_shard_budget: u64,
    metrics: Arc<Metrics>,

    total_bytes: AtomicU64,
    total_items: AtomicU64,
}

impl EntryContentCache {
    /// `max_bytes` is the decompressed-content budget across all shards;
    /// zero disables the cache (every `get` misses, `put` is a no-op).
    pub fn new(max_bytes: u64, metrics: Arc<Metrics>) -> Self {
        let per_shard_budget = if max_bytes == 0 {
            0
        } else {
            (max_bytes / NUM_SHARDS as u64).max(1)
        };

        let shards = (0..NUM_SHARDS)
            .map(|_| {
                Mutex::new(EntryShard {
                    items: LruCache::unbounded(),
                    cur_bytes: 0,
                })
            })
            .collect();

        Self {
            shards,
            per_shard_budget,
            metrics,
            total_bytes: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.per_shard_budget > 0
    }

    fn composite_key(zip_path: &Path, entry_name: &str) -> String {
        format!("{}\0{}", zip_path.to_string_lossy(), entry_name)
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        (hasher.finish() % NUM_SHARDS as u64) as usize
    }

    /// Cached decompressed content for the entry, promoting it on hit.
    pub fn get(&self, zip_path: &Path, entry_name: &str) -> Option<Bytes> {
        if !self.enabled() {
            return None;
        }

        let key = Self::composite_key(zip_path, entry_name);
        let found = self.shards[self.shard_index(&key)]
            .lock()
            .items
            .get(&key)
            .cloned();

        match &found {
            Some(_) => self.metrics.inc_entry_cache_hits(),
            None => self.metrics.inc_entry_cache_misses(),
        }
        found
    }

    /// Store decompressed content, evicting LRU items until it fits. Items
    /// larger than the per-shard budget are not cached.
    pub fn put(&self, zip_path: &Path, entry_name: &str, data: Bytes) {
        if !self.enabled() {
            return;
        }

        let size = data.len() as u64;
        if size > self.per_shard_budget {
            return;
        }

        let key = Self::composite_key(zip_path, entry_name);
        let mut shard = self.shards[self.shard_index(&key)].lock();

        // Replace in place: drop the old accounting first.
        if let Some(old) = shard.items.pop(&key) {
            shard.cur_bytes -= old.len() as u64;
            self.total_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
            self.total_items.fetch_sub(1, Ordering::Relaxed);
        }

        while shard.cur_bytes + size > self.per_shard_budget {
            let Some((_, evicted)) = shard.items.pop_lru() else {
                break;
            };
            shard.cur_bytes -= evicted.len() as u64;
            self.total_bytes
                .fetch_sub(evicted.len() as u64, Ordering::Relaxed);
            self.total_items.fetch_sub(1, Ordering::Relaxed);
            self.metrics.inc_entry_cache_evictions();
        }

        shard.items.put(key, data);
        shard.cur_bytes += size;
        drop(shard);

        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        self.total_items.fetch_add(1, Ordering::Relaxed);
        self.publish_usage();
    }

    /// Remove every cached entry belonging to `zip_path`. Entries for one
    /// zip spread across shards, so this scans all of them; invalidation is
    /// a cold path.
    pub fn invalidate(&self, zip_path: &Path) {
        if !self.enabled() {
            return;
        }

        let prefix = format!("{}\0", zip_path.to_string_lossy());
        for shard in &self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<String> = shard
                .items
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                if let Some(data) = shard.items.pop(&key) {
                    shard.cur_bytes -= data.len() as u64;
                    self.total_bytes
                        .fetch_sub(data.len() as u64, Ordering::Relaxed);
                    self.total_items.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        self.publish_usage();
    }

    /// Aggregate usage; approximate under concurrent mutation.
    pub fn usage(&self) -> (u64, u64) {
        (
            self.total_bytes.load(Ordering::Relaxed),
            self.total_items.load(Ordering::Relaxed),
        )
    }

    fn publish_usage(&self) {
        let (bytes, items) = self.usage();
        self.metrics.set_entry_cache_usage(bytes, items);
    }
}
