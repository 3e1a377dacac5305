//! Zip entry store façade
//!
//! `open_entry` resolves one zip entry through the layered lookup order:
//!
//! 1. entry-content cache (zero I/O)
//! 2. cached open reader (index lookup, decompress only)
//! 3. cold path: stat → integrity gate → populate the reader cache → read
//! 4. on-demand open when no reader cache is configured
//!
//! Read failures against a cached reader evict it and invalidate the
//! integrity record so a corrupt part is re-verified on the next request.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use ctarchive_common::{Error, Result};

use crate::entry_cache::EntryContentCache;
use crate::integrity::IntegrityGate;
use crate::part_cache::{CachedZip, ZipPartCache};

pub struct ZipStore {
    integrity: Arc<IntegrityGate>,
    parts: Option<Arc<ZipPartCache>>,
    contents: Option<Arc<EntryContentCache>>,
}

impl ZipStore {
    pub fn new(integrity: Arc<IntegrityGate>) -> Self {
        Self {
            integrity,
            parts: None,
            contents: None,
        }
    }

    pub fn with_part_cache(mut self, cache: Arc<ZipPartCache>) -> Self {
        self.parts = Some(cache);
        self
    }

    pub fn with_entry_cache(mut self, cache: Arc<EntryContentCache>) -> Self {
        self.contents = Some(cache);
        self
    }

    /// Resolve the bytes of `entry_name` inside the zip at `zip_path`.
    ///
    /// Errors: [`Error::NotFound`] for a missing zip part or entry,
    /// [`Error::TemporarilyUnavailable`] for integrity failures and read
    /// errors.
    pub async fn open_entry(&self, zip_path: &Path, entry_name: &str) -> Result<Bytes> {
        // Fast path: decompressed content, zero I/O.
        if let Some(contents) = &self.contents {
            if let Some(data) = contents.get(zip_path, entry_name) {
                return Ok(data);
            }
        }

        // Fast path: cached open reader; the part was validated when cached.
        if let Some(parts) = &self.parts {
            if let Some(cached) = parts.cached(zip_path) {
                return self.read_from_cached(cached, zip_path, entry_name).await;
            }
        }

        // Cold path: stat, integrity gate, then populate the reader cache.
        match tokio::fs::metadata(zip_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.integrity.invalidate_passed(zip_path);
                return Err(Error::NotFound);
            }
            Err(e) => {
                self.integrity.invalidate_passed(zip_path);
                return Err(Error::unavailable(format!("stat zip: {e}")));
            }
        }

        self.integrity.check(zip_path).await?;

        if let Some(parts) = &self.parts {
            let cached = parts.get(zip_path).await?;
            return self.read_from_cached(cached, zip_path, entry_name).await;
        }

        self.open_on_demand(zip_path, entry_name).await
    }

    async fn read_from_cached(
        &self,
        zip: Arc<CachedZip>,
        zip_path: &Path,
        entry_name: &str,
    ) -> Result<Bytes> {
        let owned_name = entry_name.to_string();
        let reader = Arc::clone(&zip);
        let read = tokio::task::spawn_blocking(move || reader.read_entry(&owned_name))
            .await
            .map_err(|e| Error::internal(format!("entry read task failed: {e}")))?;

        match read {
            Ok(Some(data)) => {
                let data = Bytes::from(data);
                if let Some(contents) = &self.contents {
                    contents.put(zip_path, entry_name, data.clone());
                }
                Ok(data)
            }
            Ok(None) => Err(Error::NotFound),
            Err(e) => {
                // The cached reader went bad underneath us: evict it and
                // force re-verification on the next request.
                warn!(
                    zip = %zip_path.display(),
                    entry = %entry_name,
                    error = %e,
                    "read against cached zip reader failed"
                );
                if let Some(parts) = &self.parts {
                    parts.remove(zip_path);
                }
                self.integrity.invalidate_passed(zip_path);
                Err(e)
            }
        }
    }

    /// Fallback used when no reader cache is configured: open, read the one
    /// entry, and let the reader drop.
    async fn open_on_demand(&self, zip_path: &Path, entry_name: &str) -> Result<Bytes> {
        let owned_path = zip_path.to_path_buf();
        let owned_name = entry_name.to_string();
        let read = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            use std::io::Read as _;

            let file = std::fs::File::open(&owned_path)
                .map_err(|e| Error::unavailable(format!("open zip: {e}")))?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| Error::unavailable(format!("parse zip: {e}")))?;

            let mut entry = match archive.by_name(&owned_name) {
                Ok(entry) => entry,
                Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                Err(e) => return Err(Error::unavailable(format!("open entry: {e}"))),
            };
            let mut buf = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry
                .read_to_end(&mut buf)
                .map_err(|e| Error::unavailable(format!("read entry: {e}")))?;
            Ok(Some(buf))
        })
        .await
        .map_err(|e| Error::internal(format!("entry read task failed: {e}")))?;

        match read {
            Ok(Some(data)) => Ok(Bytes::from(data)),
            Ok(None) => Err(Error::NotFound),
            Err(e) => {
                self.integrity.invalidate_passed(zip_path);
                Err(e)
            }
        }
    }
}
