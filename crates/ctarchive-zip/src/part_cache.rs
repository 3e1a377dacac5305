//! Sharded LRU cache of open zip readers
//!
//! Amortizes central-directory parsing for hot zip parts. The cache is split
//! into 64 shards selected by FNV-1a of the zip path; each shard owns its
//! LRU and singleflight group, so concurrent requests for different paths
//! never contend on one lock. A global semaphore bounds concurrent
//! open-and-parse operations to prevent I/O storms on cold starts.

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hasher as _;
use std::io::Read as _;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHasher;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use ctarchive_common::{Error, Metrics, Result};

use crate::flight::FlightGroup;

const NUM_SHARDS: usize = 64;

/// An open zip reader with a prebuilt entry-name index.
///
/// The `zip` crate needs `&mut` access to decompress an entry, so the
/// archive sits behind its own mutex; the name index is immutable and
/// answers existence checks without locking.
#[derive(Debug)]
pub struct CachedZip {
    path: PathBuf,
    names: HashMap<String, usize>,
    archive: Mutex<zip::ZipArchive<File>>,
}

impl CachedZip {
    /// Open the zip and build the entry index. Blocking.
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::unavailable(format!("open zip {}: {e}", path.display())))?;
        let archive = zip::ZipArchive::new(file)
            .map_err(|e| Error::unavailable(format!("parse zip {}: {e}", path.display())))?;

        let mut names = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            if let Some(name) = archive.name_for_index(i) {
                names.insert(name.to_string(), i);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            names,
            archive: Mutex::new(archive),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, entry_name: &str) -> bool {
        self.names.contains_key(entry_name)
    }

    pub fn entry_count(&self) -> usize {
        self.names.len()
    }

    /// Decompress one entry to memory. Blocking; holds the archive lock for
    /// the duration of the read.
    ///
    /// Returns `Ok(None)` when the entry name is not in the index.
    pub fn read_entry(&self, entry_name: &str) -> Result<Option<Vec<u8>>> {
        let Some(&index) = self.names.get(entry_name) else {
            return Ok(None);
        };

        let mut archive = self.archive.lock();
        let mut entry = archive.by_index(index).map_err(|e| {
            Error::unavailable(format!("open entry {entry_name:?} in {}: {e}", self.path.display()))
        })?;

        let mut buf = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry.read_to_end(&mut buf).map_err(|e| {
            Error::unavailable(format!("read entry {entry_name:?} in {}: {e}", self.path.display()))
        })?;
        Ok(Some(buf))
    }
}

struct Shard {
    entries: Mutex<LruCache<PathBuf, Arc<CachedZip>>>,
    flights: FlightGroup<std::result::Result<Arc<CachedZip>, Arc<Error>>>,
}

/// Sharded, bounded LRU cache of open zip readers.
pub struct ZipPartCache {
    shards: Vec<Shard>,
    open_sem: Semaphore,
    open_count: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ZipPartCache {
    /// `max_open` is the total budget across shards (each shard gets at
    /// least one slot); `max_concurrent_opens` bounds cold opens globally.
    pub fn new(max_open: usize, max_concurrent_opens: usize, metrics: Arc<Metrics>) -> Self {
        let per_shard = (max_open / NUM_SHARDS).max(1);
        let shards = (0..NUM_SHARDS)
            .map(|_| Shard {
                entries: Mutex::new(LruCache::new(
                    NonZeroUsize::new(per_shard).expect("per-shard capacity is at least 1"),
                )),
                flights: FlightGroup::new(),
            })
            .collect();

        Self {
            shards,
            open_sem: Semaphore::new(max_concurrent_opens.max(1)),
            open_count: AtomicU64::new(0),
            metrics,
        }
    }

    fn shard_index(&self, path: &Path) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(path.as_os_str().as_encoded_bytes());
        (hasher.finish() % NUM_SHARDS as u64) as usize
    }

    fn shard(&self, path: &Path) -> &Shard {
        &self.shards[self.shard_index(path)]
    }

    /// Return the cached reader for `path` without opening on miss. Never
    /// blocks on I/O.
    pub fn cached(&self, path: &Path) -> Option<Arc<CachedZip>> {
        self.shard(path).entries.lock().get(path).cloned()
    }

    /// Return the cached reader, opening and indexing the zip on miss.
    ///
    /// Concurrent misses for the same path perform exactly one open.
    pub async fn get(&self, path: &Path) -> Result<Arc<CachedZip>> {
        if let Some(entry) = self.cached(path) {
            return Ok(entry);
        }

        let shard = self.shard(path);
        let result = shard
            .flights
            .run(path, || async {
                // Another task may have populated the shard while we queued.
                if let Some(entry) = shard.entries.lock().get(path).cloned() {
                    return Ok(entry);
                }

                let _permit = self
                    .open_sem
                    .acquire()
                    .await
                    .map_err(|e| Arc::new(Error::internal(format!("open semaphore: {e}"))))?;

                let owned = path.to_path_buf();
                let opened = tokio::task::spawn_blocking(move || CachedZip::open(&owned))
                    .await
                    .map_err(|e| Arc::new(Error::internal(format!("open task failed: {e}"))))?;

                let zip = Arc::new(opened.map_err(Arc::new)?);

                let mut entries = shard.entries.lock();
                // Double-check: a Remove/Get race may have inserted meanwhile.
                if let Some(existing) = entries.get(path) {
                    return Ok(Arc::clone(existing));
                }
                let evicted = entries.push(path.to_path_buf(), Arc::clone(&zip));
                drop(entries);

                if evicted.is_some() {
                    // One reader out, one in: the open count is unchanged.
                    self.metrics.inc_zip_cache_evictions();
                } else {
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics
                    .set_zip_cache_open(self.open_count.load(Ordering::Relaxed));

                Ok(zip)
            })
            .await;

        result.map_err(|e| Error::unavailable(format!("zip part cache: {e}")))
    }

    /// Drop the cached reader for `path`. Called when reads against it fail.
    pub fn remove(&self, path: &Path) {
        let removed = self.shard(path).entries.lock().pop(path).is_some();
        if removed {
            self.open_count.fetch_sub(1, Ordering::Relaxed);
            self.metrics
                .set_zip_cache_open(self.open_count.load(Ordering::Relaxed));
        }
    }

    /// Current number of cached open readers.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }
}
